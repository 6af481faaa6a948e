use super::{json_pretty, package_ids, with_spinner, CmdResult, EXIT_SUCCESS};
use kiln_core::{Engine, UploadRequest};
use kiln_remote::{PackageOutcome, RecipeOutcome};

pub struct UploadArgs<'a> {
    pub pattern: &'a str,
    pub remote: Option<&'a str>,
    pub all: bool,
    pub packages: &'a [String],
    pub force: bool,
    pub confirm: bool,
    pub retry: Option<u32>,
    pub retry_wait: Option<u64>,
}

pub fn run(engine: &Engine, args: &UploadArgs<'_>, json: bool) -> CmdResult {
    let request = UploadRequest {
        pattern: args.pattern.to_owned(),
        remote: args.remote.map(str::to_owned),
        all_packages: args.all,
        packages: package_ids(args.packages),
        force: args.force,
        confirm: args.confirm,
        retry: args.retry,
        retry_wait: args.retry_wait,
    };
    let reports = with_spinner(
        &format!("uploading {}…", args.pattern),
        "upload complete",
        "upload failed",
        || engine.upload(&request),
    )?;

    if json {
        let payload: Vec<_> = reports
            .iter()
            .map(|r| {
                serde_json::json!({
                    "reference": r.reference,
                    "remote": r.remote,
                    "recipe_uploaded": r.recipe == RecipeOutcome::Uploaded,
                    "packages": r.packages.iter().map(|(id, outcome)| serde_json::json!({
                        "id": id.as_str(),
                        "uploaded": *outcome == PackageOutcome::Uploaded,
                    })).collect::<Vec<_>>(),
                })
            })
            .collect();
        println!("{}", json_pretty(&payload)?);
    } else {
        for r in &reports {
            let uploaded = r
                .packages
                .iter()
                .filter(|(_, o)| *o == PackageOutcome::Uploaded)
                .count();
            let recipe = match r.recipe {
                RecipeOutcome::Uploaded => "uploaded",
                RecipeOutcome::Unchanged => "unchanged",
            };
            println!(
                "{} -> '{}': recipe {recipe}, {uploaded}/{} packages uploaded",
                r.reference,
                r.remote,
                r.packages.len()
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
