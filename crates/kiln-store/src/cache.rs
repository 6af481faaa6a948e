use crate::archive::{stage, StagedFolder};
use crate::fsutil::{prune_empty_parents, remove_dir_if_exists};
use crate::info::PackageInfo;
use crate::layout::{CacheLayout, PackageFolder, RecipeFolder};
use crate::lock::RefLock;
use crate::manifest::{Manifest, EXPORT_SOURCES_DIR};
use crate::metadata::{PackageState, RecipeMetadata, RecipeState, SourceState};
use crate::StoreError;
use kiln_schema::{PackageId, PackageReference, RecipeHash, RecipeReference, RefPattern};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// What to delete from each recipe matched by [`LocalStore::remove`].
///
/// The default scope removes whole recipes. `Some(vec![])` for packages or
/// builds means "all of them"; a non-empty list restricts removal to those
/// PackageIDs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoveScope {
    pub packages: Option<Vec<PackageId>>,
    pub builds: Option<Vec<PackageId>>,
    pub sources: bool,
}

impl RemoveScope {
    pub fn is_whole_recipe(&self) -> bool {
        self.packages.is_none() && self.builds.is_none() && !self.sources
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RemoveReport {
    pub recipes: Vec<RecipeReference>,
    pub sources: Vec<RecipeReference>,
    pub packages: Vec<PackageReference>,
    pub builds: Vec<PackageReference>,
}

impl RemoveReport {
    pub fn is_empty(&self) -> bool {
        self.recipes.is_empty()
            && self.sources.is_empty()
            && self.packages.is_empty()
            && self.builds.is_empty()
    }
}

/// The local cache: sole owner of the on-disk layout.
#[derive(Debug, Clone)]
pub struct LocalStore {
    layout: CacheLayout,
}

impl LocalStore {
    pub fn new(layout: CacheLayout) -> Self {
        Self { layout }
    }

    /// Open (and initialize if needed) the cache at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let layout = CacheLayout::new(root);
        layout.initialize()?;
        Ok(Self { layout })
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn recipe_path(&self, reference: &RecipeReference, folder: RecipeFolder) -> PathBuf {
        self.layout.recipe_path(reference, folder)
    }

    pub fn package_path(&self, package: &PackageReference, folder: PackageFolder) -> PathBuf {
        self.layout.package_path(package, folder)
    }

    pub fn lock(&self, reference: &RecipeReference) -> Result<RefLock, StoreError> {
        RefLock::acquire(&self.layout.lock_file(reference))
    }

    /// A fresh, empty folder in the staging area.
    pub fn staging(&self) -> Result<StagedFolder, StoreError> {
        StagedFolder::empty(&self.layout.staging_dir())
    }

    /// Extract an archive into the staging area.
    pub fn stage_archive(&self, data: &[u8]) -> Result<StagedFolder, StoreError> {
        stage(data, &self.layout.staging_dir())
    }

    // --- status records ---

    pub fn metadata(&self, reference: &RecipeReference) -> Result<RecipeMetadata, StoreError> {
        RecipeMetadata::load(&self.layout.metadata_file(reference)).map_err(|e| match e {
            StoreError::NotFound(_) => StoreError::NotFound(format!("recipe {reference}")),
            other => other,
        })
    }

    /// Load, modify, and save a status record while the caller holds the
    /// reference's lock.
    pub fn modify_metadata<F>(
        &self,
        _lock: &RefLock,
        reference: &RecipeReference,
        f: F,
    ) -> Result<RecipeMetadata, StoreError>
    where
        F: FnOnce(&mut RecipeMetadata) -> Result<(), StoreError>,
    {
        let mut meta = self.metadata(reference)?;
        f(&mut meta)?;
        meta.save(&self.layout.metadata_file(reference))?;
        Ok(meta)
    }

    /// Lock the reference and modify its status record.
    pub fn update_metadata<F>(
        &self,
        reference: &RecipeReference,
        f: F,
    ) -> Result<RecipeMetadata, StoreError>
    where
        F: FnOnce(&mut RecipeMetadata) -> Result<(), StoreError>,
    {
        let lock = self.lock(reference)?;
        self.modify_metadata(&lock, reference, f)
    }

    // --- queries ---

    /// A recipe exists once its status record and export manifest are in place.
    pub fn exists(&self, reference: &RecipeReference) -> bool {
        self.layout.metadata_file(reference).is_file()
            && self
                .recipe_path(reference, RecipeFolder::Export)
                .join(crate::MANIFEST_FILE)
                .is_file()
    }

    pub fn package_exists(&self, package: &PackageReference) -> bool {
        self.package_path(package, PackageFolder::Package)
            .join(crate::MANIFEST_FILE)
            .is_file()
    }

    /// PackageIDs with a folder under `package/`, sorted.
    pub fn package_ids(&self, reference: &RecipeReference) -> Result<Vec<PackageId>, StoreError> {
        list_ids(&self.layout.packages_dir(reference))
    }

    /// PackageIDs with a folder under `build/`, sorted.
    pub fn build_ids(&self, reference: &RecipeReference) -> Result<Vec<PackageId>, StoreError> {
        list_ids(&self.layout.builds_dir(reference))
    }

    pub fn export_manifest(&self, reference: &RecipeReference) -> Result<Manifest, StoreError> {
        Manifest::load(&self.recipe_path(reference, RecipeFolder::Export)).map_err(|e| match e {
            StoreError::NotFound(_) => StoreError::NotFound(format!("recipe {reference}")),
            other => other,
        })
    }

    pub fn package_manifest(&self, package: &PackageReference) -> Result<Manifest, StoreError> {
        Manifest::load(&self.package_path(package, PackageFolder::Package)).map_err(|e| match e {
            StoreError::NotFound(_) => StoreError::NotFound(format!("package {package}")),
            other => other,
        })
    }

    pub fn package_info(&self, package: &PackageReference) -> Result<PackageInfo, StoreError> {
        PackageInfo::load(&self.package_path(package, PackageFolder::Package))
    }

    /// Fingerprint of the stored export manifest.
    pub fn recipe_hash(&self, reference: &RecipeReference) -> Result<RecipeHash, StoreError> {
        Ok(self.export_manifest(reference)?.fingerprint())
    }

    pub fn compute_export_manifest(
        &self,
        reference: &RecipeReference,
    ) -> Result<Manifest, StoreError> {
        Manifest::compute(&self.recipe_path(reference, RecipeFolder::Export))
    }

    /// Whether the export folder no longer matches its stored manifest.
    ///
    /// Entries under `export_source/` are only compared when the status record
    /// says the sources are materialized.
    pub fn is_stale(&self, reference: &RecipeReference) -> Result<bool, StoreError> {
        let stored = self.export_manifest(reference)?;
        let with_sources = self.metadata(reference)?.export_sources;
        let export = self.recipe_path(reference, RecipeFolder::Export);
        let stale = !content_matches(&export, &stored, with_sources)?;
        if stale {
            debug!("export of {reference} differs from its manifest");
        }
        Ok(stale)
    }

    pub fn package_is_stale(&self, package: &PackageReference) -> Result<bool, StoreError> {
        let stored = self.package_manifest(package)?;
        let folder = self.package_path(package, PackageFolder::Package);
        Ok(!content_matches(&folder, &stored, true)?)
    }

    /// Lazily enumerate cached recipes matching `pattern`.
    pub fn list(&self, pattern: &RefPattern) -> RecipeIter {
        RecipeIter::new(self.layout.data_dir(), pattern.clone())
    }

    // --- commits ---

    /// Move a staged export folder into place and record the recipe.
    ///
    /// `manifest` is written into the folder first. If the cached export
    /// already carries a manifest with the same content and its files still
    /// match it, the staged copy is dropped and `Ok(false)` is returned, so
    /// concurrent installs of the same recipe converge on one result. A
    /// hand-edited export is always replaced.
    pub fn commit_recipe(
        &self,
        reference: &RecipeReference,
        staged: StagedFolder,
        manifest: &Manifest,
        state: RecipeState,
        export_sources: bool,
    ) -> Result<bool, StoreError> {
        let lock = self.lock(reference)?;
        let dest = self.recipe_path(reference, RecipeFolder::Export);
        let unchanged = match (Manifest::load(&dest), self.metadata(reference)) {
            (Ok(existing), Ok(meta)) if existing.same_content(manifest) => {
                content_matches(&dest, manifest, meta.export_sources)?
            }
            _ => false,
        };
        if unchanged {
            debug!("{reference}: export unchanged, keeping cached copy");
            return Ok(false);
        }
        manifest.save(staged.path())?;
        staged.commit(&dest)?;

        let meta_path = self.layout.metadata_file(reference);
        let mut meta = match RecipeMetadata::load(&meta_path) {
            Ok(m) => m,
            Err(StoreError::NotFound(_) | StoreError::Integrity { .. }) => {
                RecipeMetadata::new(reference.clone(), state)
            }
            Err(e) => return Err(e),
        };
        meta.recipe = state;
        meta.export_sources = export_sources;
        meta.save(&meta_path)?;
        drop(lock);
        info!("{reference}: recipe stored ({state})");
        Ok(true)
    }

    /// Materialize `export/export_source/` from a staged folder.
    pub fn commit_export_sources(
        &self,
        reference: &RecipeReference,
        staged: StagedFolder,
    ) -> Result<(), StoreError> {
        let lock = self.lock(reference)?;
        staged.commit(&self.recipe_path(reference, RecipeFolder::ExportSources))?;
        self.modify_metadata(&lock, reference, |m| {
            m.export_sources = true;
            Ok(())
        })?;
        Ok(())
    }

    /// Move a populated source tree into `source/`.
    pub fn commit_source(
        &self,
        reference: &RecipeReference,
        staged: StagedFolder,
    ) -> Result<(), StoreError> {
        let lock = self.lock(reference)?;
        staged.commit(&self.recipe_path(reference, RecipeFolder::Source))?;
        self.modify_metadata(&lock, reference, |m| {
            m.source = SourceState::Populated;
            Ok(())
        })?;
        Ok(())
    }

    /// Move a staged package folder into place with its manifest.
    ///
    /// Returns `Ok(false)` when an identical, untampered package is already
    /// cached; its recorded state is still raised to `state` if that is
    /// `Published`.
    pub fn commit_package(
        &self,
        package: &PackageReference,
        staged: StagedFolder,
        manifest: &Manifest,
        state: PackageState,
    ) -> Result<bool, StoreError> {
        let reference = &package.recipe;
        let lock = self.lock(reference)?;
        // The recipe must be present before any of its packages.
        self.metadata(reference)?;

        let dest = self.package_path(package, PackageFolder::Package);
        let unchanged = match Manifest::load(&dest) {
            Ok(existing) if existing.same_content(manifest) => {
                content_matches(&dest, manifest, true)?
            }
            _ => false,
        };
        if unchanged {
            debug!("{package}: package unchanged, keeping cached copy");
        } else {
            manifest.save(staged.path())?;
            staged.commit(&dest)?;
        }
        self.modify_metadata(&lock, reference, |m| {
            let id = package.package_id.clone();
            if !(unchanged && m.package_state(&id) == Some(PackageState::Published)) {
                m.packages.insert(id, state);
            }
            Ok(())
        })?;
        Ok(!unchanged)
    }

    pub fn set_package_state(
        &self,
        package: &PackageReference,
        state: PackageState,
    ) -> Result<(), StoreError> {
        self.update_metadata(&package.recipe, |m| {
            m.packages.insert(package.package_id.clone(), state);
            Ok(())
        })?;
        Ok(())
    }

    // --- removal ---

    /// Delete matching recipes or parts of them.
    ///
    /// No match is `NotFound` and several matches are `Conflict` unless
    /// `force` is set. An explicit PackageID that does not exist is
    /// `NotFound` unless `force` is set; the check runs before anything is
    /// deleted.
    pub fn remove(
        &self,
        pattern: &RefPattern,
        scope: &RemoveScope,
        force: bool,
    ) -> Result<RemoveReport, StoreError> {
        let mut matches: Vec<RecipeReference> = self.list(pattern).collect();
        matches.sort();
        let mut report = RemoveReport::default();

        if matches.is_empty() {
            if force {
                return Ok(report);
            }
            return Err(StoreError::NotFound(format!(
                "no cached recipe matches '{pattern}'"
            )));
        }
        if matches.len() > 1 && !force {
            let names: Vec<String> = matches.iter().map(ToString::to_string).collect();
            return Err(StoreError::Conflict(format!(
                "'{pattern}' matches {} recipes ({}); use force to remove them all",
                matches.len(),
                names.join(", ")
            )));
        }

        for reference in &matches {
            self.remove_one(reference, scope, force, &mut report)?;
        }
        Ok(report)
    }

    fn remove_one(
        &self,
        reference: &RecipeReference,
        scope: &RemoveScope,
        force: bool,
        report: &mut RemoveReport,
    ) -> Result<(), StoreError> {
        let _lock = self.lock(reference)?;

        if scope.is_whole_recipe() {
            let dir = self.layout.recipe_dir(reference);
            remove_dir_if_exists(&dir)?;
            prune_empty_parents(&dir, &self.layout.data_dir());
            info!("removed {reference}");
            report.recipes.push(reference.clone());
            return Ok(());
        }

        let package_targets = scope
            .packages
            .as_deref()
            .map(|ids| select_ids(reference, ids, self.package_ids(reference)?, force))
            .transpose()?;
        let build_targets = scope
            .builds
            .as_deref()
            .map(|ids| select_ids(reference, ids, self.build_ids(reference)?, force))
            .transpose()?;

        if scope.sources {
            remove_dir_if_exists(&self.recipe_path(reference, RecipeFolder::Source))?;
            report.sources.push(reference.clone());
        }
        for id in build_targets.unwrap_or_default() {
            let p = reference.package(id);
            remove_dir_if_exists(&self.package_path(&p, PackageFolder::Build))?;
            report.builds.push(p);
        }
        let removed_packages = package_targets.unwrap_or_default();
        for id in &removed_packages {
            let p = reference.package(id.clone());
            remove_dir_if_exists(&self.package_path(&p, PackageFolder::Package))?;
            report.packages.push(p);
        }

        let meta_path = self.layout.metadata_file(reference);
        match RecipeMetadata::load(&meta_path) {
            Ok(mut meta) => {
                if scope.sources {
                    meta.source = SourceState::Absent;
                }
                for id in &removed_packages {
                    meta.packages.remove(id);
                }
                meta.save(&meta_path)?;
            }
            Err(e) => warn!("{reference}: status record not updated: {e}"),
        }
        Ok(())
    }

    /// Remove one recipe entirely, without pattern semantics.
    pub fn remove_recipe(&self, reference: &RecipeReference) -> Result<bool, StoreError> {
        let _lock = self.lock(reference)?;
        let dir = self.layout.recipe_dir(reference);
        let removed = remove_dir_if_exists(&dir)?;
        prune_empty_parents(&dir, &self.layout.data_dir());
        Ok(removed)
    }
}

/// Resolve an id filter against the ids present; empty means all.
fn select_ids(
    reference: &RecipeReference,
    requested: &[PackageId],
    present: Vec<PackageId>,
    force: bool,
) -> Result<Vec<PackageId>, StoreError> {
    if requested.is_empty() {
        return Ok(present);
    }
    let mut out = Vec::new();
    for id in requested {
        if present.contains(id) {
            out.push(id.clone());
        } else if !force {
            return Err(StoreError::NotFound(format!("package {reference}:{id}")));
        }
    }
    Ok(out)
}

fn list_ids(dir: &Path) -> Result<Vec<PackageId>, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut ids = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            let id = PackageId::new(name);
            if id.is_well_formed() {
                ids.push(id);
            }
        }
    }
    ids.sort();
    Ok(ids)
}

/// Lazy, restartable walk over `data/<name>/<version>/<user>/<channel>`.
///
/// Each directory level is read and sorted only when reached, so matching
/// stops costing I/O as soon as the caller stops iterating.
pub struct RecipeIter {
    pattern: RefPattern,
    stack: Vec<(Vec<String>, std::vec::IntoIter<(String, PathBuf)>)>,
}

impl RecipeIter {
    fn new(data_dir: PathBuf, pattern: RefPattern) -> Self {
        let mut iter = Self {
            pattern,
            stack: Vec::new(),
        };
        iter.push_level(Vec::new(), &data_dir);
        iter
    }

    fn push_level(&mut self, parts: Vec<String>, dir: &Path) {
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("cannot list {}: {e}", dir.display());
                }
                return;
            }
        };
        let mut children: Vec<(String, PathBuf)> = entries
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
            .filter_map(|e| {
                let name = e.file_name().to_str()?.to_owned();
                (!name.starts_with('.')).then(|| (name, e.path()))
            })
            .collect();
        children.sort();
        self.stack.push((parts, children.into_iter()));
    }
}

impl Iterator for RecipeIter {
    type Item = RecipeReference;

    fn next(&mut self) -> Option<RecipeReference> {
        loop {
            let (parts, children) = self.stack.last_mut()?;
            let Some((name, path)) = children.next() else {
                self.stack.pop();
                continue;
            };
            let mut parts = parts.clone();
            parts.push(name);
            if parts.len() < 4 {
                self.push_level(parts, &path);
                continue;
            }
            if !path.join("metadata.json").is_file() {
                continue;
            }
            let Ok(reference) = RecipeReference::new(&parts[0], &parts[1], &parts[2], &parts[3])
            else {
                continue;
            };
            if self.pattern.matches(&reference) {
                return Some(reference);
            }
        }
    }
}

/// Whether the files in `folder` are exactly those `expected` lists.
/// `export_source/` entries only count when `with_sources` is set.
fn content_matches(
    folder: &Path,
    expected: &Manifest,
    with_sources: bool,
) -> Result<bool, StoreError> {
    let current = Manifest::compute(folder)?;
    Ok(if with_sources {
        current.same_content(expected)
    } else {
        current
            .without_dir(EXPORT_SOURCES_DIR)
            .same_content(&expected.without_dir(EXPORT_SOURCES_DIR))
    })
}
