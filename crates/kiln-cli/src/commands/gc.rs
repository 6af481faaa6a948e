use super::{json_pretty, CmdResult, EXIT_SUCCESS};
use kiln_core::{CancelToken, Engine};

pub fn run(engine: &Engine, dry_run: bool, json: bool) -> CmdResult {
    let report = engine.gc(dry_run, &CancelToken::from_signal())?;
    if json {
        let staging: Vec<String> = report
            .staging_entries
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        let payload = serde_json::json!({
            "dry_run": dry_run,
            "build_folders": report.build_folders,
            "staging_entries": staging,
            "skipped_in_progress": report.skipped_in_progress,
            "removed_builds": report.removed_builds,
            "removed_staging": report.removed_staging,
        });
        println!("{}", json_pretty(&payload)?);
    } else if dry_run {
        println!(
            "gc: would remove {} build folders, {} staging entries",
            report.build_folders.len(),
            report.staging_entries.len()
        );
        for p in &report.build_folders {
            println!("  {p}");
        }
    } else {
        println!(
            "gc: removed {} build folders, {} staging entries",
            report.removed_builds, report.removed_staging
        );
    }
    for p in &report.skipped_in_progress {
        eprintln!("skipped {p}: build in progress");
    }
    Ok(EXIT_SUCCESS)
}
