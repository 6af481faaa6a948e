use crate::cache::LocalStore;
use crate::layout::{CacheLayout, PackageFolder};
use crate::lock::RefLock;
use crate::metadata::{PackageState, RecipeMetadata};
use crate::StoreError;
use kiln_schema::{PackageReference, RefPattern};
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

/// Staging entries younger than this may belong to a running operation.
pub const STAGING_GRACE: Duration = Duration::from_secs(15 * 60);

/// Reclaims disposable space: `build/` folders and abandoned staging entries.
pub struct GarbageCollector {
    layout: CacheLayout,
}

#[derive(Debug, Default)]
pub struct GcReport {
    pub build_folders: Vec<PackageReference>,
    pub staging_entries: Vec<PathBuf>,
    /// Build folders of packages recorded as still building, or whose
    /// reference lock another process holds.
    pub skipped_in_progress: Vec<PackageReference>,
    pub removed_builds: usize,
    pub removed_staging: usize,
}

impl GarbageCollector {
    pub fn new(layout: CacheLayout) -> Self {
        Self { layout }
    }

    pub fn collect(&self, dry_run: bool) -> Result<GcReport, StoreError> {
        self.collect_with_cancel(dry_run, STAGING_GRACE, || false)
    }

    pub fn collect_with_cancel(
        &self,
        dry_run: bool,
        staging_grace: Duration,
        should_stop: impl Fn() -> bool,
    ) -> Result<GcReport, StoreError> {
        let store = LocalStore::new(self.layout.clone());
        let mut report = GcReport::default();

        for reference in store.list(&RefPattern::any()) {
            let meta = RecipeMetadata::load(&self.layout.metadata_file(&reference)).ok();
            for id in store.build_ids(&reference)? {
                let building = meta
                    .as_ref()
                    .and_then(|m| m.package_state(&id))
                    .is_some_and(|s| s == PackageState::Building);
                let p = reference.package(id);
                if building {
                    report.skipped_in_progress.push(p);
                } else {
                    report.build_folders.push(p);
                }
            }
        }

        let now = SystemTime::now();
        if let Ok(entries) = fs::read_dir(self.layout.staging_dir()) {
            for entry in entries {
                let entry = entry?;
                let age = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|t| now.duration_since(t).ok())
                    .unwrap_or_default();
                if age >= staging_grace {
                    report.staging_entries.push(entry.path());
                }
            }
        }
        report.staging_entries.sort();

        if !dry_run {
            let mut busy = Vec::new();
            for p in &report.build_folders {
                if should_stop() {
                    break;
                }
                let Some(_lock) = RefLock::try_acquire(&self.layout.lock_file(&p.recipe))? else {
                    debug!("{} is locked, keeping build folder of {p}", p.recipe);
                    busy.push(p.clone());
                    continue;
                };
                let path = store.package_path(p, PackageFolder::Build);
                if path.exists() {
                    fs::remove_dir_all(&path)?;
                }
                debug!("removed build folder of {p}");
                report.removed_builds += 1;
            }
            report.build_folders.retain(|p| !busy.contains(p));
            report.skipped_in_progress.extend(busy);

            for path in &report.staging_entries {
                if should_stop() {
                    break;
                }
                if path.is_dir() {
                    fs::remove_dir_all(path)?;
                } else if path.exists() {
                    fs::remove_file(path)?;
                }
                report.removed_staging += 1;
            }
            info!(
                "gc removed {} build folders, {} staging entries",
                report.removed_builds, report.removed_staging
            );
        }

        Ok(report)
    }
}
