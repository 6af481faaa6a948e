pub mod check_updates;
pub mod completions;
pub mod copy;
pub mod export;
pub mod gc;
pub mod info;
pub mod install;
pub mod man_pages;
pub mod remote;
pub mod remove;
pub mod search;
pub mod upload;
pub mod verify;

use indicatif::{ProgressBar, ProgressStyle};
use kiln_core::CoreError;
use kiln_remote::RemoteError;
use kiln_schema::{PackageId, RecipeReference};
use std::fmt;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_MISSING_BINARY: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;
pub const EXIT_REMOTE_ERROR: u8 = 4;

/// A failed command: message for stderr plus the process exit code.
#[derive(Debug)]
pub struct Failure {
    pub code: u8,
    pub message: String,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

pub fn exit_code(err: &CoreError) -> u8 {
    match err {
        CoreError::MissingBinary { .. } => EXIT_MISSING_BINARY,
        CoreError::Store(_) | CoreError::Io(_) | CoreError::Remote(RemoteError::Store(_)) => {
            EXIT_STORE_ERROR
        }
        CoreError::Remote(_) => EXIT_REMOTE_ERROR,
        _ => EXIT_FAILURE,
    }
}

impl From<CoreError> for Failure {
    fn from(err: CoreError) -> Self {
        Self {
            code: exit_code(&err),
            message: err.to_string(),
        }
    }
}

impl From<String> for Failure {
    fn from(message: String) -> Self {
        Self {
            code: EXIT_FAILURE,
            message,
        }
    }
}

pub type CmdResult = Result<u8, Failure>;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        pb.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    }
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn finish(pb: &ProgressBar, msg: String) {
    if let Ok(style) = ProgressStyle::with_template("{msg}") {
        pb.set_style(style);
    }
    pb.finish_with_message(msg);
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    finish(pb, format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    finish(pb, format!("✗ {msg}"));
}

/// Run `f` behind a spinner, closing it with `ok` or `failed`.
pub fn with_spinner<T>(
    msg: &str,
    ok: &str,
    failed: &str,
    f: impl FnOnce() -> Result<T, CoreError>,
) -> Result<T, CoreError> {
    let pb = spinner(msg);
    match f() {
        Ok(v) => {
            spin_ok(&pb, ok);
            Ok(v)
        }
        Err(e) => {
            spin_fail(&pb, failed);
            Err(e)
        }
    }
}

pub fn colorize_state(state: &str) -> String {
    use console::Style;
    match state {
        "published" => Style::new().green().apply_to(state).to_string(),
        "packaged" => Style::new().cyan().apply_to(state).to_string(),
        "building" => Style::new().yellow().apply_to(state).to_string(),
        "outdated" => Style::new().red().apply_to(state).to_string(),
        "absent" => Style::new().dim().apply_to(state).to_string(),
        other => other.to_owned(),
    }
}

pub fn parse_reference(input: &str) -> Result<RecipeReference, Failure> {
    input
        .parse()
        .map_err(|e: kiln_schema::SchemaError| CoreError::from(e).into())
}

pub fn package_ids(values: &[String]) -> Vec<PackageId> {
    values.iter().map(|v| PackageId::new(v.as_str())).collect()
}

/// `user/channel` as given to `copy`.
pub fn split_user_channel(input: &str) -> Result<(&str, &str), Failure> {
    match input.split_once('/') {
        Some((user, channel)) if !user.is_empty() && !channel.is_empty() => Ok((user, channel)),
        _ => Err(format!("expected 'user/channel', got '{input}'").into()),
    }
}
