use super::{json_pretty, package_ids, parse_reference, split_user_channel, CmdResult, EXIT_SUCCESS};
use kiln_core::Engine;

pub fn run(
    engine: &Engine,
    reference: &str,
    user_channel: &str,
    packages: &[String],
    all: bool,
    force: bool,
    json: bool,
) -> CmdResult {
    let source = parse_reference(reference)?;
    let (user, channel) = split_user_channel(user_channel)?;
    let ids = package_ids(packages);
    let selection = if all {
        Some(&[][..])
    } else if ids.is_empty() {
        None
    } else {
        Some(ids.as_slice())
    };
    let report = engine.copy(&source, user, channel, selection, force)?;
    if json {
        let ids: Vec<&str> = report.packages.iter().map(|id| id.as_str()).collect();
        let payload = serde_json::json!({
            "source": source,
            "reference": report.reference,
            "packages": ids,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "copied {source} to {} ({} packages)",
            report.reference,
            report.packages.len()
        );
    }
    Ok(EXIT_SUCCESS)
}
