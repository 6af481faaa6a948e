use super::{json_pretty, CmdResult, EXIT_SUCCESS};
use kiln_core::Engine;
use kiln_remote::UpdateStatus;

fn describe(status: &UpdateStatus) -> String {
    match status {
        UpdateStatus::UpToDate { remote } => format!("up to date with '{remote}'"),
        UpdateStatus::UpdateAvailable { remote, diff } => format!("update available on '{remote}' ({diff})"),
        UpdateStatus::LocalNewer { remote } => format!("local copy is newer than '{remote}'"),
        UpdateStatus::NotOnRemote { remote } => format!("not on '{remote}'"),
        UpdateStatus::NoRemote => "no provenance remote".to_owned(),
    }
}

pub fn run(engine: &Engine, pattern: &str, json: bool) -> CmdResult {
    let statuses = engine.check_updates(pattern)?;
    if json {
        let payload: Vec<_> = statuses
            .iter()
            .map(|(r, s)| {
                serde_json::json!({
                    "reference": r,
                    "update_available": matches!(s, UpdateStatus::UpdateAvailable { .. }),
                    "status": describe(s),
                })
            })
            .collect();
        println!("{}", json_pretty(&payload)?);
    } else {
        for (reference, status) in &statuses {
            println!("{reference}: {}", describe(status));
        }
    }
    Ok(EXIT_SUCCESS)
}
