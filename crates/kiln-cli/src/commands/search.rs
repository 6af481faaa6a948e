use super::{json_pretty, CmdResult, EXIT_SUCCESS};
use kiln_core::Engine;

pub fn run(
    engine: &Engine,
    pattern: &str,
    remote: Option<&str>,
    case_insensitive: bool,
    json: bool,
) -> CmdResult {
    let found = engine.search(pattern, remote, case_insensitive)?;
    if json {
        println!("{}", json_pretty(&found)?);
    } else if found.is_empty() {
        match remote {
            Some(r) => println!("no recipes matching '{pattern}' on '{r}'"),
            None => println!("no recipes matching '{pattern}'"),
        }
    } else {
        for r in &found {
            println!("{r}");
        }
    }
    Ok(EXIT_SUCCESS)
}
