use super::{colorize_state, json_pretty, parse_reference, CmdResult, EXIT_SUCCESS};
use kiln_core::Engine;

pub fn run(engine: &Engine, reference: &str, json: bool) -> CmdResult {
    let reference = parse_reference(reference)?;
    let info = engine.info(&reference)?;
    if json {
        let packages: Vec<_> = info
            .packages
            .iter()
            .map(|p| {
                serde_json::json!({
                    "id": p.id.as_str(),
                    "state": p.state.map(|s| s.to_string()),
                    "outdated": p.outdated,
                    "settings": p.config.as_ref().map(|c| &c.settings),
                    "options": p.config.as_ref().map(|c| &c.options),
                })
            })
            .collect();
        let payload = serde_json::json!({
            "reference": info.reference,
            "state": info.state.to_string(),
            "export_sources": info.export_sources,
            "source": info.source.to_string(),
            "remote": info.remote,
            "packages": packages,
        });
        println!("{}", json_pretty(&payload)?);
        return Ok(EXIT_SUCCESS);
    }

    println!("reference:       {}", info.reference);
    println!("state:           {}", info.state);
    println!("remote:          {}", info.remote.as_deref().unwrap_or("(none)"));
    println!(
        "export sources:  {}",
        if info.export_sources { "present" } else { "not fetched" }
    );
    println!("source:          {}", colorize_state(&info.source.to_string()));
    if info.packages.is_empty() {
        println!("packages:        (none)");
    }
    for p in &info.packages {
        let state = p.state.map_or_else(|| "unknown".to_owned(), |s| s.to_string());
        let mut line = format!("  {}  {}", p.id, colorize_state(&state));
        if p.outdated {
            line.push_str(&format!(" {}", colorize_state("outdated")));
        }
        println!("{line}");
        if let Some(config) = &p.config {
            for (k, v) in config.pairs() {
                println!("      {k}={v}");
            }
        }
    }
    Ok(EXIT_SUCCESS)
}
