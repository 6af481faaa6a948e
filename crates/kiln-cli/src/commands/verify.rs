use super::{json_pretty, CmdResult, EXIT_STORE_ERROR, EXIT_SUCCESS};
use kiln_core::Engine;

pub fn run(engine: &Engine, pattern: &str, json: bool) -> CmdResult {
    let report = engine.verify(pattern)?;

    if json {
        let failed: Vec<_> = report
            .failed
            .iter()
            .map(|f| serde_json::json!({ "subject": f.subject, "reason": f.reason }))
            .collect();
        let payload = serde_json::json!({
            "recipes_checked": report.recipes_checked,
            "recipes_passed": report.recipes_passed,
            "packages_checked": report.packages_checked,
            "packages_passed": report.packages_passed,
            "failed": failed,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "cache integrity: {}/{} recipes, {}/{} packages passed",
            report.recipes_passed,
            report.recipes_checked,
            report.packages_passed,
            report.packages_checked
        );
        for f in &report.failed {
            println!("  FAIL {}: {}", f.subject, f.reason);
        }
    }

    if report.is_clean() {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(EXIT_STORE_ERROR)
    }
}
