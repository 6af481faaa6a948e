//! End-to-end cache scenarios against an in-memory remote.

use kiln_core::{
    BuildContext, BuildMode, BuildReason, CallbackResult, CancelToken, CoreError, Decision,
    Engine, InstallOptions, KilnfileRecipe, PackageContext, RecipeCallbacks, Settings,
    SourceContext, UploadRequest,
};
use kiln_remote::{MemoryConnector, Method, Remote, RemoteError, UpdateStatus};
use kiln_schema::{BinaryConfig, PackageReference, RecipeReference, RECIPE_FILE};
use kiln_store::{pack, ArchiveKind, Manifest, PackageFolder, PackageState, RecipeFolder};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

const RECIPE: &str = r#"name = "Hello"
version = "0.1"
exports = ["*.h"]
exports_sources = ["src/*"]

[[package]]
pattern = "*.h"
dst = "include"

[[package]]
pattern = "*.c"
src = "src"
dst = "src"
"#;

const REMOTE_PATH: &str = "/v1/recipes/Hello/0.1/lasote/testing";

fn write_recipe(dir: &Path, header: &str) {
    fs::create_dir_all(dir.join("src")).unwrap();
    fs::write(dir.join(RECIPE_FILE), RECIPE).unwrap();
    fs::write(dir.join("hello.h"), header).unwrap();
    fs::write(dir.join("src/hello.c"), "int hello(void) { return 0; }").unwrap();
}

fn fast_settings() -> Settings {
    let mut s = Settings::default();
    s.upload.retry = 0;
    s.upload.retry_wait = 0;
    s
}

/// A cache under `root` wired to the shared in-memory remotes, with
/// `default` registered.
fn cache(root: &Path, connector: &Arc<MemoryConnector>) -> Engine {
    let engine = Engine::open(root, connector.clone())
        .unwrap()
        .with_settings(fast_settings());
    engine
        .registry_add(Remote::new("default", "memory://default", true), None)
        .unwrap();
    engine
}

fn hello() -> RecipeReference {
    "Hello/0.1@lasote/testing".parse().unwrap()
}

fn linux() -> BinaryConfig {
    let mut config = BinaryConfig::default();
    config.settings = BTreeMap::from([("os".to_owned(), "Linux".to_owned())]);
    config
}

fn options(mode: BuildMode) -> InstallOptions {
    InstallOptions {
        config: linux(),
        build_mode: mode,
        remote: None,
        update: false,
    }
}

fn upload_all(engine: &Engine) {
    engine
        .upload(&UploadRequest {
            pattern: hello().to_string(),
            all_packages: true,
            ..UploadRequest::default()
        })
        .unwrap();
}

struct Producer {
    _tmp: tempfile::TempDir,
    recipe_dir: PathBuf,
    engine: Engine,
    package: PackageReference,
}

/// Export Hello, build it for Linux, and upload everything to `default`.
fn publish(connector: &Arc<MemoryConnector>) -> Producer {
    let tmp = tempfile::tempdir().unwrap();
    let recipe_dir = tmp.path().join("recipe");
    write_recipe(&recipe_dir, "#define HELLO 1");
    let engine = cache(&tmp.path().join("cache"), connector);
    engine
        .export(&recipe_dir, "lasote", "testing", false)
        .unwrap();
    let installed = engine
        .install(
            &hello(),
            &options(BuildMode::Missing),
            &KilnfileRecipe,
            &CancelToken::new(),
        )
        .unwrap();
    upload_all(&engine);
    Producer {
        _tmp: tmp,
        recipe_dir,
        engine,
        package: installed.package,
    }
}

#[derive(Default)]
struct Counting {
    sources: AtomicUsize,
    builds: AtomicUsize,
}

impl RecipeCallbacks for Counting {
    fn source(&self, ctx: &SourceContext<'_>) -> CallbackResult {
        self.sources.fetch_add(1, Ordering::SeqCst);
        KilnfileRecipe.source(ctx)
    }

    fn build(&self, ctx: &BuildContext<'_>) -> CallbackResult {
        self.builds.fetch_add(1, Ordering::SeqCst);
        KilnfileRecipe.build(ctx)
    }

    fn package(&self, ctx: &PackageContext<'_>) -> CallbackResult {
        KilnfileRecipe.package(ctx)
    }
}

struct FailingBuild;

impl RecipeCallbacks for FailingBuild {
    fn source(&self, ctx: &SourceContext<'_>) -> CallbackResult {
        KilnfileRecipe.source(ctx)
    }

    fn build(&self, _ctx: &BuildContext<'_>) -> CallbackResult {
        Err("compiler exited with status 1".into())
    }

    fn package(&self, _ctx: &PackageContext<'_>) -> CallbackResult {
        unreachable!("package stage runs only after a successful build")
    }
}

/// Simulates SIGINT arriving while the build runs.
struct InterruptedBuild;

impl RecipeCallbacks for InterruptedBuild {
    fn source(&self, ctx: &SourceContext<'_>) -> CallbackResult {
        KilnfileRecipe.source(ctx)
    }

    fn build(&self, ctx: &BuildContext<'_>) -> CallbackResult {
        ctx.cancel.cancel();
        Err("terminated by signal".into())
    }

    fn package(&self, _ctx: &PackageContext<'_>) -> CallbackResult {
        unreachable!("package stage runs only after a successful build")
    }
}

#[test]
fn upload_wipe_install_restores_export_and_package() {
    let connector = MemoryConnector::new();
    let producer = publish(&connector);
    let original_export = producer.engine.store().export_manifest(&hello()).unwrap();
    let original_package = producer
        .engine
        .store()
        .package_manifest(&producer.package)
        .unwrap();

    let tmp = tempfile::tempdir().unwrap();
    let consumer = cache(tmp.path(), &connector);
    let counting = Counting::default();
    let result = consumer
        .install(
            &hello(),
            &options(BuildMode::Never),
            &counting,
            &CancelToken::new(),
        )
        .unwrap();

    assert!(result.recipe_downloaded);
    assert_eq!(result.package, producer.package);
    assert_eq!(
        result.decision,
        Decision::Download {
            remote: "default".to_owned()
        }
    );
    assert_eq!(counting.builds.load(Ordering::SeqCst), 0);

    let store = consumer.store();
    assert!(store
        .export_manifest(&hello())
        .unwrap()
        .same_content(&original_export));
    assert!(store
        .package_manifest(&result.package)
        .unwrap()
        .same_content(&original_package));
    assert!(!store.package_is_stale(&result.package).unwrap());
    assert!(!store.recipe_path(&hello(), RecipeFolder::Source).exists());
    assert!(!store.recipe_path(&hello(), RecipeFolder::ExportSources).exists());
    assert_eq!(
        store
            .metadata(&hello())
            .unwrap()
            .package_state(&result.package.package_id),
        Some(PackageState::Published)
    );
}

#[test]
fn never_mode_without_any_binary_is_missing_binary() {
    let connector = MemoryConnector::new();
    let producer = publish(&connector);

    // the remote has the recipe but not a Windows package
    let tmp = tempfile::tempdir().unwrap();
    let consumer = cache(tmp.path(), &connector);
    let mut windows = options(BuildMode::Never);
    windows
        .config
        .settings
        .insert("os".to_owned(), "Windows".to_owned());
    let counting = Counting::default();
    let err = consumer
        .install(&hello(), &windows, &counting, &CancelToken::new())
        .unwrap_err();

    match err {
        CoreError::MissingBinary { package, policy } => {
            assert_eq!(package.recipe, hello());
            assert_ne!(package, producer.package);
            assert_eq!(policy, "never");
        }
        other => panic!("expected MissingBinary, got {other}"),
    }
    assert_eq!(counting.sources.load(Ordering::SeqCst), 0);
    assert_eq!(counting.builds.load(Ordering::SeqCst), 0);
    assert!(consumer.store().package_ids(&hello()).unwrap().is_empty());
}

#[test]
fn reexported_recipe_marks_package_outdated() {
    let tmp = tempfile::tempdir().unwrap();
    let recipe_dir = tmp.path().join("recipe");
    write_recipe(&recipe_dir, "#define HELLO 1");
    let engine = Engine::open(tmp.path().join("cache"), MemoryConnector::new())
        .unwrap()
        .with_settings(fast_settings());
    engine
        .export(&recipe_dir, "lasote", "testing", false)
        .unwrap();
    let counting = Counting::default();
    let cancel = CancelToken::new();
    engine
        .install(&hello(), &options(BuildMode::Missing), &counting, &cancel)
        .unwrap();
    assert_eq!(counting.builds.load(Ordering::SeqCst), 1);

    // unchanged recipe: reuse in every mode
    let again = engine
        .install(&hello(), &options(BuildMode::Outdated), &counting, &cancel)
        .unwrap();
    assert_eq!(again.decision, Decision::Reuse);

    write_recipe(&recipe_dir, "#define HELLO 2");
    engine
        .export(&recipe_dir, "lasote", "testing", false)
        .unwrap();
    let info = engine.info(&hello()).unwrap();
    assert!(info.packages[0].outdated);

    let missing = engine
        .install(&hello(), &options(BuildMode::Missing), &counting, &cancel)
        .unwrap();
    assert_eq!(missing.decision, Decision::Reuse);

    let outdated = engine
        .install(&hello(), &options(BuildMode::Outdated), &counting, &cancel)
        .unwrap();
    assert_eq!(
        outdated.decision,
        Decision::Build {
            reason: BuildReason::Outdated
        }
    );
    assert_eq!(counting.builds.load(Ordering::SeqCst), 2);
    assert!(!engine.info(&hello()).unwrap().packages[0].outdated);
    let header = engine
        .store()
        .package_path(&outdated.package, PackageFolder::Package)
        .join("include/hello.h");
    assert_eq!(fs::read_to_string(header).unwrap(), "#define HELLO 2");
}

#[test]
fn concurrent_downloads_converge() {
    let connector = MemoryConnector::new();
    let producer = publish(&connector);
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().to_path_buf();
    // register the remote once, then open two handles on the same cache
    drop(cache(&root, &connector));

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let barrier = Arc::clone(&barrier);
            let connector = connector.clone();
            let root = root.clone();
            thread::spawn(move || {
                let engine = Engine::open(&root, connector)
                    .unwrap()
                    .with_settings(fast_settings());
                barrier.wait();
                let result = engine
                    .install(
                        &hello(),
                        &options(BuildMode::Never),
                        &KilnfileRecipe,
                        &CancelToken::new(),
                    )
                    .unwrap();
                engine.store().package_manifest(&result.package).unwrap()
            })
        })
        .collect();
    let manifests: Vec<Manifest> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(manifests[0].same_content(&manifests[1]));
    let engine = Engine::open(&root, connector.clone()).unwrap();
    assert!(!engine.store().package_is_stale(&producer.package).unwrap());
    assert!(engine.verify("*").unwrap().is_clean());
}

#[test]
fn corrupted_package_archive_is_rejected_without_partial_folder() {
    let connector = MemoryConnector::new();
    let producer = publish(&connector);

    let bogus = tempfile::tempdir().unwrap();
    fs::write(bogus.path().join("evil.so"), "not what the manifest says").unwrap();
    let archive = pack(bogus.path(), ArchiveKind::Package).unwrap();
    connector.remote("default").put_raw(
        &format!(
            "{REMOTE_PATH}/packages/{}/archives/{}",
            producer.package.package_id,
            ArchiveKind::Package.file_name()
        ),
        archive,
    );

    let tmp = tempfile::tempdir().unwrap();
    let consumer = cache(tmp.path(), &connector);
    let err = consumer
        .install(
            &hello(),
            &options(BuildMode::Never),
            &KilnfileRecipe,
            &CancelToken::new(),
        )
        .unwrap_err();
    assert!(
        matches!(err, CoreError::Remote(RemoteError::Integrity { .. })),
        "unexpected error: {err}"
    );
    assert!(!consumer
        .store()
        .package_path(&producer.package, PackageFolder::Package)
        .exists());
    // the recipe itself was fine and stays
    assert!(consumer.store().exists(&hello()));
}

#[test]
fn second_upload_of_unchanged_recipe_transfers_nothing() {
    let connector = MemoryConnector::new();
    let producer = publish(&connector);
    let remote = connector.remote("default");
    remote.clear_log();

    let reports = producer
        .engine
        .upload(&UploadRequest {
            pattern: hello().to_string(),
            all_packages: true,
            ..UploadRequest::default()
        })
        .unwrap();
    assert_eq!(reports.len(), 1);
    assert!(!reports[0].transferred());
    assert_eq!(remote.count(Method::Put), 0);
}

#[test]
fn build_failure_is_reported_and_leaves_no_package() {
    let tmp = tempfile::tempdir().unwrap();
    let recipe_dir = tmp.path().join("recipe");
    write_recipe(&recipe_dir, "#define HELLO 1");
    let engine = Engine::open(tmp.path().join("cache"), MemoryConnector::new()).unwrap();
    engine
        .export(&recipe_dir, "lasote", "testing", false)
        .unwrap();

    let err = engine
        .install(
            &hello(),
            &options(BuildMode::Missing),
            &FailingBuild,
            &CancelToken::new(),
        )
        .unwrap_err();
    match &err {
        CoreError::BuildFailed {
            package,
            stage,
            reason,
        } => {
            assert!(package.starts_with("Hello/0.1@lasote/testing:"));
            assert_eq!(stage, "build");
            assert!(reason.contains("status 1"));
        }
        other => panic!("expected BuildFailed, got {other}"),
    }

    let package = hello().package(linux().package_id());
    let meta = engine.store().metadata(&hello()).unwrap();
    assert_eq!(meta.package_state(&package.package_id), None);
    assert!(!engine.store().package_exists(&package));
    // the source stage succeeded and is kept for the next attempt
    assert!(engine
        .store()
        .recipe_path(&hello(), RecipeFolder::Source)
        .is_dir());

    let retry = engine
        .install(
            &hello(),
            &options(BuildMode::Missing),
            &KilnfileRecipe,
            &CancelToken::new(),
        )
        .unwrap();
    assert_eq!(retry.package, package);
}

#[test]
fn cancelled_build_reports_cancellation() {
    let tmp = tempfile::tempdir().unwrap();
    let recipe_dir = tmp.path().join("recipe");
    write_recipe(&recipe_dir, "#define HELLO 1");
    let engine = Engine::open(tmp.path().join("cache"), MemoryConnector::new()).unwrap();
    engine
        .export(&recipe_dir, "lasote", "testing", false)
        .unwrap();

    let cancel = CancelToken::new();
    let err = engine
        .install(
            &hello(),
            &options(BuildMode::Missing),
            &InterruptedBuild,
            &cancel,
        )
        .unwrap_err();
    assert!(matches!(err, CoreError::Cancelled(_)), "unexpected error: {err}");
    let package = hello().package(linux().package_id());
    assert_eq!(
        engine
            .store()
            .metadata(&hello())
            .unwrap()
            .package_state(&package.package_id),
        None
    );

    // an already cancelled token stops before touching anything
    let err = engine
        .install(
            &hello(),
            &options(BuildMode::Missing),
            &KilnfileRecipe,
            &cancel,
        )
        .unwrap_err();
    assert!(matches!(err, CoreError::Cancelled(_)));
}

#[test]
fn update_pulls_newer_recipe_and_rebuilds_outdated_package() {
    let connector = MemoryConnector::new();
    let producer = publish(&connector);

    let tmp = tempfile::tempdir().unwrap();
    let consumer = cache(tmp.path(), &connector);
    consumer
        .install(
            &hello(),
            &options(BuildMode::Never),
            &KilnfileRecipe,
            &CancelToken::new(),
        )
        .unwrap();

    write_recipe(&producer.recipe_dir, "#define HELLO 2");
    producer
        .engine
        .export(&producer.recipe_dir, "lasote", "testing", false)
        .unwrap();
    producer
        .engine
        .upload(&UploadRequest {
            pattern: hello().to_string(),
            force: true,
            ..UploadRequest::default()
        })
        .unwrap();
    // make the remote copy strictly newer than anything exported this second
    let remote = connector.remote("default");
    let path = format!("{REMOTE_PATH}/manifest");
    let text = String::from_utf8(remote.get_raw(&path).unwrap()).unwrap();
    let mut manifest = Manifest::parse(&text).unwrap();
    manifest.time += 60;
    remote.put_raw(&path, manifest.serialize());

    let updates = consumer.check_updates("*").unwrap();
    assert!(matches!(
        &updates[0].1,
        UpdateStatus::UpdateAvailable { remote, .. } if remote == "default"
    ));

    let mut opts = options(BuildMode::Outdated);
    opts.update = true;
    let result = consumer
        .install(&hello(), &opts, &KilnfileRecipe, &CancelToken::new())
        .unwrap();
    assert!(result.recipe_downloaded);
    assert_eq!(
        result.decision,
        Decision::Build {
            reason: BuildReason::Outdated
        }
    );
    let store = consumer.store();
    // export sources were fetched on demand for the rebuild
    assert!(store.metadata(&hello()).unwrap().export_sources);
    let header = store
        .package_path(&result.package, PackageFolder::Package)
        .join("include/hello.h");
    assert_eq!(fs::read_to_string(header).unwrap(), "#define HELLO 2");
}

#[test]
fn pattern_upload_of_several_recipes_needs_confirmation() {
    let connector = MemoryConnector::new();
    let tmp = tempfile::tempdir().unwrap();
    let recipe_dir = tmp.path().join("recipe");
    write_recipe(&recipe_dir, "#define HELLO 1");
    let engine = cache(&tmp.path().join("cache"), &connector);
    engine
        .export(&recipe_dir, "lasote", "testing", false)
        .unwrap();
    engine
        .export(&recipe_dir, "lasote", "stable", false)
        .unwrap();

    let mut request = UploadRequest {
        pattern: "Hello*".to_owned(),
        ..UploadRequest::default()
    };
    let err = engine.upload(&request).unwrap_err();
    assert!(matches!(err, CoreError::Conflict(_)));

    request.confirm = true;
    let reports = engine.upload(&request).unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(
        engine.search("*", Some("default"), false).unwrap().len(),
        2
    );
}

#[test]
fn transient_remote_failures_are_retried() {
    let connector = MemoryConnector::new();
    let tmp = tempfile::tempdir().unwrap();
    let recipe_dir = tmp.path().join("recipe");
    write_recipe(&recipe_dir, "#define HELLO 1");
    let engine = cache(&tmp.path().join("cache"), &connector);
    engine
        .export(&recipe_dir, "lasote", "testing", false)
        .unwrap();

    connector.remote("default").fail_next(2);
    let reports = engine
        .upload(&UploadRequest {
            pattern: hello().to_string(),
            retry: Some(3),
            retry_wait: Some(0),
            ..UploadRequest::default()
        })
        .unwrap();
    assert!(reports[0].transferred());

    connector.remote("default").fail_next(1);
    let err = engine
        .upload(&UploadRequest {
            pattern: hello().to_string(),
            force: true,
            retry: Some(0),
            ..UploadRequest::default()
        })
        .unwrap_err();
    assert!(matches!(err, CoreError::Remote(ref e) if e.is_transient()));
}

#[test]
fn remote_removal_clears_provenance() {
    let connector = MemoryConnector::new();
    let producer = publish(&connector);
    let removed = producer
        .engine
        .remove_on_remote("Hello*", "default", None, false)
        .unwrap();
    assert_eq!(removed, vec![hello()]);
    assert!(producer.engine.registry_references().unwrap().is_empty());
    assert!(producer
        .engine
        .search("*", Some("default"), false)
        .unwrap()
        .is_empty());
}

#[test]
fn gc_removes_build_folders() {
    let connector = MemoryConnector::new();
    let producer = publish(&connector);
    let build = producer
        .engine
        .store()
        .package_path(&producer.package, PackageFolder::Build);
    assert!(build.is_dir());

    let dry = producer.engine.gc(true, &CancelToken::new()).unwrap();
    assert_eq!(dry.build_folders, vec![producer.package.clone()]);
    assert!(build.is_dir());

    producer.engine.gc(false, &CancelToken::new()).unwrap();
    assert!(!build.exists());
    assert!(producer.engine.verify("*").unwrap().is_clean());
}
