use super::{json_pretty, CmdResult, EXIT_SUCCESS};
use kiln_core::Engine;
use std::path::Path;

pub fn run(
    engine: &Engine,
    recipe_dir: &Path,
    user: &str,
    channel: &str,
    keep_source: bool,
    json: bool,
) -> CmdResult {
    let result = engine.export(recipe_dir, user, channel, keep_source)?;
    if json {
        let payload = serde_json::json!({
            "reference": result.reference,
            "changed": result.changed,
            "source_removed": result.source_removed,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        let verb = if result.changed { "exported" } else { "unchanged" };
        println!("{}: {verb}", result.reference);
        if result.source_removed {
            println!("source folder removed, it will be rebuilt on next build");
        }
    }
    Ok(EXIT_SUCCESS)
}
