use super::{json_pretty, parse_reference, with_spinner, CmdResult, Failure, EXIT_SUCCESS};
use kiln_core::{BuildMode, CancelToken, CoreError, Engine, InstallOptions, KilnfileRecipe};
use kiln_schema::{parse_assignment, BinaryConfig};
use std::collections::BTreeMap;

pub struct InstallArgs<'a> {
    pub reference: &'a str,
    pub settings: &'a [String],
    pub options: &'a [String],
    pub env: &'a [String],
    /// `None` when `--build` was not given at all.
    pub build: Option<&'a [String]>,
    pub remote: Option<&'a str>,
    pub update: bool,
}

fn assignments(values: &[String]) -> Result<BTreeMap<String, String>, Failure> {
    values
        .iter()
        .map(|v| parse_assignment(v).map_err(|e| Failure::from(CoreError::from(e))))
        .collect()
}

pub fn binary_config(args: &InstallArgs<'_>) -> Result<BinaryConfig, Failure> {
    Ok(BinaryConfig {
        settings: assignments(args.settings)?,
        options: assignments(args.options)?,
        env: assignments(args.env)?,
    })
}

pub fn run(engine: &Engine, args: &InstallArgs<'_>, json: bool) -> CmdResult {
    let reference = parse_reference(args.reference)?;
    let build_mode = BuildMode::from_args(args.build, &engine.settings().default_build_mode()?)?;
    let options = InstallOptions {
        config: binary_config(args)?,
        build_mode,
        remote: args.remote.map(str::to_owned),
        update: args.update,
    };
    let cancel = CancelToken::from_signal();

    let result = with_spinner(
        &format!("installing {reference}…"),
        &format!("{reference} installed"),
        &format!("{reference} not installed"),
        || engine.install(&reference, &options, &KilnfileRecipe, &cancel),
    )?;

    if json {
        let payload = serde_json::json!({
            "package": result.package,
            "decision": result.decision.to_string(),
            "recipe_downloaded": result.recipe_downloaded,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        if result.recipe_downloaded {
            println!("{reference}: recipe downloaded");
        }
        println!("{}: {}", result.package, result.decision);
    }
    Ok(EXIT_SUCCESS)
}
