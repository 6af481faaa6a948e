use super::{json_pretty, package_ids, CmdResult, Failure, EXIT_SUCCESS};
use kiln_core::Engine;
use kiln_store::RemoveScope;

pub struct RemoveArgs<'a> {
    pub pattern: &'a str,
    /// `Some(&[])` selects every package.
    pub packages: Option<&'a [String]>,
    pub builds: Option<&'a [String]>,
    pub src: bool,
    pub force: bool,
    pub remote: Option<&'a str>,
}

pub fn run(engine: &Engine, args: &RemoveArgs<'_>, json: bool) -> CmdResult {
    if let Some(remote) = args.remote {
        return run_remote(engine, remote, args, json);
    }
    let scope = RemoveScope {
        packages: args.packages.map(package_ids),
        builds: args.builds.map(package_ids),
        sources: args.src,
    };
    let report = engine.remove(args.pattern, &scope, args.force)?;
    if json {
        let payload = serde_json::json!({
            "recipes": report.recipes,
            "sources": report.sources,
            "packages": report.packages,
            "builds": report.builds,
        });
        println!("{}", json_pretty(&payload)?);
    } else if report.is_empty() {
        println!("nothing to remove");
    } else {
        for r in &report.recipes {
            println!("removed {r}");
        }
        for r in &report.sources {
            println!("removed source of {r}");
        }
        for p in &report.packages {
            println!("removed package {p}");
        }
        for p in &report.builds {
            println!("removed build folder of {p}");
        }
    }
    Ok(EXIT_SUCCESS)
}

fn run_remote(engine: &Engine, remote: &str, args: &RemoveArgs<'_>, json: bool) -> CmdResult {
    if args.builds.is_some() || args.src {
        return Err(Failure::from(
            "--builds and --src only apply to the local cache".to_owned(),
        ));
    }
    let ids = args.packages.map(package_ids);
    let removed = engine.remove_on_remote(args.pattern, remote, ids.as_deref(), args.force)?;
    if json {
        let payload = serde_json::json!({ "remote": remote, "recipes": removed });
        println!("{}", json_pretty(&payload)?);
    } else {
        let what = if args.packages.is_some() { "packages of " } else { "" };
        for r in &removed {
            println!("removed {what}{r} from '{remote}'");
        }
    }
    Ok(EXIT_SUCCESS)
}
