//! CLI subprocess integration tests.
//!
//! These tests invoke the `kiln` binary as a subprocess against a scratch
//! cache and check exit codes, stdout content, and JSON output.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

const REFERENCE: &str = "Hello/0.1@lasote/testing";

struct Sandbox {
    _dir: tempfile::TempDir,
    cache: PathBuf,
    recipe: PathBuf,
}

impl Sandbox {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("cache");
        let recipe = dir.path().join("recipe");
        write_recipe(&recipe);
        Self {
            _dir: dir,
            cache,
            recipe,
        }
    }

    fn kiln(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_kiln"))
            .arg("--cache")
            .arg(&self.cache)
            .args(args)
            .env_remove("KILN_LOG")
            .output()
            .unwrap()
    }

    fn json(&self, args: &[&str]) -> serde_json::Value {
        let mut full = vec!["--json"];
        full.extend_from_slice(args);
        let output = self.kiln(&full);
        assert!(output.status.success(), "{}", stderr(&output));
        serde_json::from_slice(&output.stdout).unwrap()
    }

    fn export(&self) {
        let output = self.kiln(&[
            "export",
            "lasote/testing",
            "--path",
            self.recipe.to_str().unwrap(),
        ]);
        assert!(output.status.success(), "export failed: {}", stderr(&output));
    }

    fn build(&self) -> String {
        let value = self.json(&["install", REFERENCE, "-s", "os=Linux", "--build", "missing"]);
        let package = value["package"].as_str().unwrap().to_owned();
        package.rsplit_once(':').unwrap().1.to_owned()
    }

    fn package_dir(&self, id: &str) -> PathBuf {
        self.cache
            .join("data/Hello/0.1/lasote/testing/package")
            .join(id)
    }
}

fn write_recipe(dir: &Path) {
    fs::create_dir_all(dir.join("src")).unwrap();
    fs::write(
        dir.join("kilnfile.toml"),
        r#"name = "Hello"
version = "0.1"
exports = ["*.h"]
exports_sources = ["src/*"]

[[package]]
pattern = "*.h"
dst = "include"
"#,
    )
    .unwrap();
    fs::write(dir.join("hello.h"), "#define HELLO 1").unwrap();
    fs::write(dir.join("src/hello.c"), "int hello(void) { return 0; }").unwrap();
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn cli_version_exits_zero() {
    let output = Command::new(env!("CARGO_BIN_EXE_kiln"))
        .arg("--version")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(stdout(&output).contains("kiln"));
}

#[test]
fn cli_help_lists_commands() {
    let output = Command::new(env!("CARGO_BIN_EXE_kiln"))
        .arg("--help")
        .output()
        .unwrap();
    assert!(output.status.success());
    let text = stdout(&output);
    for cmd in ["export", "install", "upload", "remove", "search", "remote"] {
        assert!(text.contains(cmd), "help must list '{cmd}': {text}");
    }
}

#[test]
fn cli_export_then_build_from_source() {
    let sb = Sandbox::new();
    sb.export();
    let id = sb.build();
    assert_eq!(id.len(), 40);
    assert_eq!(
        fs::read_to_string(sb.package_dir(&id).join("include/hello.h")).unwrap(),
        "#define HELLO 1"
    );

    let info = sb.json(&["info", REFERENCE]);
    assert_eq!(info["reference"], REFERENCE);
    assert_eq!(info["state"], "exported");
    assert_eq!(info["source"], "populated");
    assert_eq!(info["packages"][0]["id"], id.as_str());
    assert_eq!(info["packages"][0]["state"], "packaged");
    assert_eq!(info["packages"][0]["settings"]["os"], "Linux");

    // a second install reuses the package
    let again = sb.json(&["install", REFERENCE, "-s", "os=Linux"]);
    assert_eq!(again["decision"], "reuse cached package");
}

#[test]
fn cli_never_policy_exits_with_missing_binary() {
    let sb = Sandbox::new();
    sb.export();
    let output = sb.kiln(&["install", REFERENCE, "-s", "os=Windows"]);
    assert_eq!(output.status.code(), Some(2), "{}", stderr(&output));
    assert!(stderr(&output).contains("missing prebuilt package"));
}

#[test]
fn cli_unknown_recipe_without_remotes_is_remote_error() {
    let sb = Sandbox::new();
    let output = sb.kiln(&["install", "Bye/1.0@lasote/testing"]);
    assert_eq!(output.status.code(), Some(4), "{}", stderr(&output));
}

#[test]
fn cli_malformed_reference_is_generic_failure() {
    let sb = Sandbox::new();
    let output = sb.kiln(&["info", "Hello"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("error:"));
}

#[test]
fn cli_mixed_build_keywords_are_rejected() {
    let sb = Sandbox::new();
    sb.export();
    let output = sb.kiln(&["install", REFERENCE, "--build", "missing,Hello"]);
    assert_eq!(output.status.code(), Some(1), "{}", stderr(&output));
    assert!(stderr(&output).contains("build mode"));
}

#[test]
fn cli_verify_detects_tampered_package() {
    let sb = Sandbox::new();
    sb.export();
    let id = sb.build();
    let clean = sb.kiln(&["verify"]);
    assert!(clean.status.success(), "{}", stdout(&clean));

    fs::write(sb.package_dir(&id).join("include/hello.h"), "tampered").unwrap();
    let output = sb.kiln(&["verify"]);
    assert_eq!(output.status.code(), Some(3));
    assert!(stdout(&output).contains("FAIL"));
}

#[test]
fn cli_copy_search_and_remove() {
    let sb = Sandbox::new();
    sb.export();
    let id = sb.build();

    let copy = sb.kiln(&["copy", REFERENCE, "other/stable", "--all"]);
    assert!(copy.status.success(), "{}", stderr(&copy));
    let conflict = sb.kiln(&["copy", REFERENCE, "other/stable"]);
    assert_eq!(conflict.status.code(), Some(1));

    let found = sb.json(&["search", "hello*", "--case-insensitive"]);
    assert_eq!(found.as_array().unwrap().len(), 2);
    let exact = sb.json(&["search", "hello*"]);
    assert!(exact.as_array().unwrap().is_empty());

    let removed = sb.json(&["remove", "Hello/0.1@other/stable", "--packages", id.as_str()]);
    assert_eq!(removed["packages"].as_array().unwrap().len(), 1);
    assert!(removed["recipes"].as_array().unwrap().is_empty());

    let ambiguous = sb.kiln(&["remove", "Hello*"]);
    assert_eq!(ambiguous.status.code(), Some(3), "{}", stderr(&ambiguous));
    let forced = sb.kiln(&["remove", "Hello*", "--force"]);
    assert!(forced.status.success());
    let empty = sb.json(&["search"]);
    assert!(empty.as_array().unwrap().is_empty());
}

#[test]
fn cli_gc_removes_build_folders() {
    let sb = Sandbox::new();
    sb.export();
    let id = sb.build();
    let build = sb.cache.join("data/Hello/0.1/lasote/testing/build").join(&id);
    assert!(build.is_dir());

    let dry = sb.json(&["gc", "--dry-run"]);
    assert_eq!(dry["build_folders"].as_array().unwrap().len(), 1);
    assert!(build.is_dir());

    let output = sb.kiln(&["gc"]);
    assert!(output.status.success());
    assert!(!build.exists());
}

#[test]
fn cli_remote_registry_commands() {
    let sb = Sandbox::new();
    for (name, url) in [("main", "https://kiln.example"), ("mirror", "http://mirror.local")] {
        let output = sb.kiln(&["remote", "add", name, url]);
        assert!(output.status.success(), "{}", stderr(&output));
    }
    let first = sb.kiln(&["remote", "add", "local", "http://localhost:9300", "--insert", "0"]);
    assert!(first.status.success());

    let remotes = sb.json(&["remote", "list"]);
    let names: Vec<&str> = remotes
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, ["local", "main", "mirror"]);

    let duplicate = sb.kiln(&["remote", "add", "main", "https://other.example"]);
    assert_eq!(duplicate.status.code(), Some(4));

    sb.export();
    let add_ref = sb.kiln(&["remote", "add-ref", REFERENCE, "mirror"]);
    assert!(add_ref.status.success(), "{}", stderr(&add_ref));
    let refs = sb.json(&["remote", "list-ref"]);
    assert_eq!(refs[0]["remote"], "mirror");

    let removed = sb.kiln(&["remote", "remove", "mirror"]);
    assert!(removed.status.success());
    let remotes = sb.json(&["remote", "list"]);
    assert_eq!(remotes.as_array().unwrap().len(), 2);
}

#[test]
fn cli_completions_mention_binary() {
    let output = Command::new(env!("CARGO_BIN_EXE_kiln"))
        .args(["completions", "bash"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(stdout(&output).contains("kiln"));
}
