use criterion::{criterion_group, criterion_main, Criterion};
use kiln_core::{BuildMode, CancelToken, Engine, InstallOptions, KilnfileRecipe};
use kiln_remote::MemoryConnector;
use kiln_schema::BinaryConfig;
use kiln_store::{pack, stage, ArchiveKind, Manifest};
use std::fs;
use std::path::Path;

fn create_test_recipe(dir: &Path) {
    fs::create_dir_all(dir.join("src")).unwrap();
    fs::write(
        dir.join("kilnfile.toml"),
        r#"name = "Bench"
version = "1.0"
exports = ["*.h"]
exports_sources = ["src/*"]

[[package]]
pattern = "*"
src = "src"
dst = "lib"
"#,
    )
    .unwrap();
    fs::write(dir.join("bench.h"), "#pragma once").unwrap();
    for i in 0..50 {
        fs::write(
            dir.join("src").join(format!("unit_{i:03}.c")),
            format!("int unit_{i}(void) {{ return {i}; }}"),
        )
        .unwrap();
    }
}

fn create_tree(dir: &Path, files: usize) {
    for i in 0..files {
        let sub = dir.join(format!("d{}", i % 10));
        fs::create_dir_all(&sub).unwrap();
        fs::write(sub.join(format!("file_{i:03}.bin")), vec![i as u8; 4096]).unwrap();
    }
}

fn bench_manifest(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    create_tree(dir.path(), 100);
    c.bench_function("manifest_compute_100files", |b| {
        b.iter(|| Manifest::compute(dir.path()).unwrap());
    });
}

fn bench_archive(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    create_tree(dir.path(), 100);
    c.bench_function("pack_package_100files", |b| {
        b.iter(|| pack(dir.path(), ArchiveKind::Package).unwrap());
    });

    let data = pack(dir.path(), ArchiveKind::Package).unwrap();
    let staging = tempfile::tempdir().unwrap();
    c.bench_function("stage_package_100files", |b| {
        b.iter(|| stage(&data, staging.path()).unwrap());
    });
}

fn bench_export(c: &mut Criterion) {
    c.bench_function("engine_export_unchanged", |b| {
        b.iter_with_setup(
            || {
                let cache_dir = tempfile::tempdir().unwrap();
                let recipe_dir = tempfile::tempdir().unwrap();
                create_test_recipe(recipe_dir.path());
                let engine = Engine::open(cache_dir.path(), MemoryConnector::new()).unwrap();
                engine
                    .export(recipe_dir.path(), "bench", "stable", false)
                    .unwrap();
                (cache_dir, recipe_dir, engine)
            },
            |(_cd, recipe_dir, engine)| {
                engine
                    .export(recipe_dir.path(), "bench", "stable", false)
                    .unwrap();
            },
        );
    });
}

fn bench_build(c: &mut Criterion) {
    c.bench_function("engine_install_build_50files", |b| {
        b.iter_with_setup(
            || {
                let cache_dir = tempfile::tempdir().unwrap();
                let recipe_dir = tempfile::tempdir().unwrap();
                create_test_recipe(recipe_dir.path());
                let engine = Engine::open(cache_dir.path(), MemoryConnector::new()).unwrap();
                let exported = engine
                    .export(recipe_dir.path(), "bench", "stable", false)
                    .unwrap();
                (cache_dir, recipe_dir, engine, exported.reference)
            },
            |(_cd, _rd, engine, reference)| {
                let options = InstallOptions {
                    config: BinaryConfig::default(),
                    build_mode: BuildMode::Missing,
                    remote: None,
                    update: false,
                };
                engine
                    .install(&reference, &options, &KilnfileRecipe, &CancelToken::new())
                    .unwrap();
            },
        );
    });
}

criterion_group!(
    benches,
    bench_manifest,
    bench_archive,
    bench_export,
    bench_build
);
criterion_main!(benches);
