use crate::callbacks::{BoxError, BuildContext, PackageContext, RecipeCallbacks, SourceContext};
use crate::concurrency::CancelToken;
use crate::lifecycle::validate_transition;
use crate::policy::{resolve, BuildMode, Decision, LocalPackage};
use crate::settings::Settings;
use crate::CoreError;
use kiln_remote::{
    Connector, RemoteError, Remote, RetryPolicy, SyncEngine, UpdateStatus, UploadOptions,
    UploadReport,
};
use kiln_schema::{
    parse_recipe_file, BinaryConfig, PackageId, PackageReference, RecipeHash, RecipeReference,
    RefPattern, RECIPE_FILE,
};
use kiln_store::fsutil::{copy_dir, remove_dir_if_exists, walk};
use kiln_store::gc::STAGING_GRACE;
use kiln_store::{
    verify_cache_integrity, GarbageCollector, GcReport, IntegrityReport, LocalStore,
    PackageFolder, PackageInfo, PackageState, RecipeFolder, RecipeState, RemoveReport,
    RemoveScope, SourceState, StoreError, EXPORT_SOURCES_DIR,
};
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Central orchestration for the kiln cache.
///
/// Holds the local store, the sync engine bound to the configured remotes,
/// and the cache settings. Every user-level operation goes through here;
/// there is no other process-wide state.
pub struct Engine {
    store: LocalStore,
    connector: Arc<dyn Connector>,
    settings: Settings,
    sync: SyncEngine,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportResult {
    pub reference: RecipeReference,
    /// False when the cache already held identical content.
    pub changed: bool,
    pub source_removed: bool,
}

#[derive(Debug, Clone)]
pub struct InstallOptions {
    pub config: BinaryConfig,
    pub build_mode: BuildMode,
    /// Remote to fetch a missing recipe from, instead of searching.
    pub remote: Option<String>,
    /// Pull strictly newer recipes and packages from the provenance remote.
    pub update: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallResult {
    pub package: PackageReference,
    pub decision: Decision,
    pub recipe_downloaded: bool,
}

/// Options for [`Engine::upload`]. Unset retry values come from `kiln.toml`.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub pattern: String,
    pub remote: Option<String>,
    pub all_packages: bool,
    pub packages: Vec<PackageId>,
    pub force: bool,
    /// Required when a pattern matches more than one recipe.
    pub confirm: bool,
    pub retry: Option<u32>,
    pub retry_wait: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyReport {
    pub reference: RecipeReference,
    pub packages: Vec<PackageId>,
}

#[derive(Debug, Clone)]
pub struct PackageSummary {
    pub id: PackageId,
    pub state: Option<PackageState>,
    pub config: Option<BinaryConfig>,
    /// Built from another recipe revision than the cached one.
    pub outdated: bool,
}

#[derive(Debug, Clone)]
pub struct RecipeInfo {
    pub reference: RecipeReference,
    pub state: RecipeState,
    pub export_sources: bool,
    pub source: SourceState,
    pub remote: Option<String>,
    pub packages: Vec<PackageSummary>,
}

impl Engine {
    /// Open the cache at `root`, creating it if needed, and load `kiln.toml`.
    pub fn open(root: impl Into<PathBuf>, connector: Arc<dyn Connector>) -> Result<Self, CoreError> {
        let store = LocalStore::open(root)?;
        let settings = Settings::load(&store.layout().config_file())?;
        debug!("cache opened at {}", store.layout().root().display());
        Ok(Self::from_parts(store, connector, settings))
    }

    #[must_use]
    pub fn with_settings(self, settings: Settings) -> Self {
        Self::from_parts(self.store, self.connector, settings)
    }

    fn from_parts(store: LocalStore, connector: Arc<dyn Connector>, settings: Settings) -> Self {
        let sync = SyncEngine::new(store.clone(), Arc::clone(&connector))
            .with_retry(settings.retry_policy());
        Self {
            store,
            connector,
            settings,
            sync,
        }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn sync(&self) -> &SyncEngine {
        &self.sync
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // --- export ---

    /// Copy a recipe directory into the cache.
    ///
    /// `export/` is fully replaced. When its content changed, a populated
    /// `source/` is removed unless `keep_source` is set.
    pub fn export(
        &self,
        recipe_dir: &Path,
        user: &str,
        channel: &str,
        keep_source: bool,
    ) -> Result<ExportResult, CoreError> {
        let recipe = parse_recipe_file(recipe_dir.join(RECIPE_FILE))?;
        let reference = recipe.reference(user, channel)?;
        info!("exporting {reference} from {}", recipe_dir.display());

        let staged = self.store.staging()?;
        copy_file(&recipe_dir.join(RECIPE_FILE), &staged.path().join(RECIPE_FILE))?;
        let exported = copy_matching(recipe_dir, &recipe.exports, staged.path())?;
        let sources = copy_matching(
            recipe_dir,
            &recipe.exports_sources,
            &staged.path().join(EXPORT_SOURCES_DIR),
        )?;
        debug!("{reference}: {exported} exported files, {sources} export sources");

        let manifest = staged.manifest()?;
        let previous = self.store.export_manifest(&reference).ok();
        let changed =
            self.store
                .commit_recipe(&reference, staged, &manifest, RecipeState::Exported, true)?;

        if !changed && sources > 0 && !self.store.metadata(&reference)?.export_sources {
            let staged = self.store.staging()?;
            copy_matching(recipe_dir, &recipe.exports_sources, staged.path())?;
            self.store.commit_export_sources(&reference, staged)?;
        }

        let mut source_removed = false;
        if previous.is_some_and(|p| !p.same_content(&manifest)) {
            if keep_source {
                debug!("{reference}: recipe changed, keeping source folder as requested");
            } else {
                source_removed = self.drop_source(&reference)?;
            }
        }
        Ok(ExportResult {
            reference,
            changed,
            source_removed,
        })
    }

    fn drop_source(&self, reference: &RecipeReference) -> Result<bool, CoreError> {
        let present = self.store.recipe_path(reference, RecipeFolder::Source).is_dir()
            || self.store.metadata(reference)?.source == SourceState::Populated;
        if present {
            let scope = RemoveScope {
                sources: true,
                ..RemoveScope::default()
            };
            self.store.remove(&exact(reference)?, &scope, true)?;
            info!("{reference}: recipe changed, source folder removed");
        }
        Ok(present)
    }

    // --- install ---

    /// Make one binary variant of `reference` available locally.
    pub fn install(
        &self,
        reference: &RecipeReference,
        options: &InstallOptions,
        callbacks: &dyn RecipeCallbacks,
        cancel: &CancelToken,
    ) -> Result<InstallResult, CoreError> {
        cancel.check(&format!("install of {reference}"))?;
        let recipe_downloaded =
            self.ensure_recipe(reference, options.remote.as_deref(), options.update)?;

        let package = reference.package(options.config.package_id());
        let recipe_hash = self.store.recipe_hash(reference)?;
        let local = self.local_package(&package, &recipe_hash)?;
        let decision = resolve(
            &package,
            &options.build_mode,
            local,
            &recipe_hash,
            &self.sync,
        )?;
        info!("{package}: {decision}");

        let decision = match decision {
            Decision::Reuse if options.update => self.pull_package_update(&package)?,
            Decision::Reuse => Decision::Reuse,
            Decision::Download { remote } => {
                let state = self.package_state(&package)?;
                if local == LocalPackage::Invalid || state == Some(PackageState::Building) {
                    self.discard_package(&package)?;
                }
                self.download(&package, &remote)?;
                Decision::Download { remote }
            }
            Decision::Build { reason } => {
                self.build_package(&package, &options.config, callbacks, cancel)?;
                Decision::Build { reason }
            }
        };

        Ok(InstallResult {
            package,
            decision,
            recipe_downloaded,
        })
    }

    /// Replace a reusable package when its provenance remote has a strictly
    /// newer one.
    fn pull_package_update(&self, package: &PackageReference) -> Result<Decision, CoreError> {
        match self.sync.check_package_updates(package)? {
            UpdateStatus::UpdateAvailable { remote, diff } => {
                info!("{package}: newer package on '{remote}'\n{diff}");
                self.download(package, &remote)?;
                Ok(Decision::Download { remote })
            }
            status => {
                debug!("{package}: {status:?}");
                Ok(Decision::Reuse)
            }
        }
    }

    /// Returns whether the recipe was (re)downloaded.
    fn ensure_recipe(
        &self,
        reference: &RecipeReference,
        remote: Option<&str>,
        update: bool,
    ) -> Result<bool, CoreError> {
        if self.store.exists(reference) {
            if !update {
                return Ok(false);
            }
            return match self.sync.check_updates(reference)? {
                UpdateStatus::UpdateAvailable { remote, diff } => {
                    info!("{reference}: newer recipe on '{remote}'\n{diff}");
                    Ok(self.sync.download_recipe(reference, &remote)?)
                }
                status => {
                    debug!("{reference}: {status:?}");
                    Ok(false)
                }
            };
        }
        let remote = self.sync.locate_recipe(reference, remote)?;
        self.sync.download_recipe(reference, &remote)?;
        Ok(true)
    }

    fn package_state(&self, package: &PackageReference) -> Result<Option<PackageState>, CoreError> {
        Ok(self
            .store
            .metadata(&package.recipe)?
            .package_state(&package.package_id))
    }

    fn local_package(
        &self,
        package: &PackageReference,
        recipe_hash: &RecipeHash,
    ) -> Result<LocalPackage, CoreError> {
        if !self.store.package_exists(package) {
            return Ok(LocalPackage::Absent);
        }
        if self.package_state(package)? == Some(PackageState::Building)
            || self.store.package_is_stale(package)?
        {
            return Ok(LocalPackage::Invalid);
        }
        let outdated = match self.store.package_info(package) {
            Ok(info) => info.recipe_hash != *recipe_hash,
            Err(e) => {
                warn!("{package}: unreadable package info, treating as outdated: {e}");
                true
            }
        };
        Ok(LocalPackage::Valid { outdated })
    }

    fn discard_package(&self, package: &PackageReference) -> Result<(), CoreError> {
        let lock = self.store.lock(&package.recipe)?;
        remove_dir_if_exists(&self.store.package_path(package, PackageFolder::Package))?;
        self.store.modify_metadata(&lock, &package.recipe, |m| {
            m.packages.remove(&package.package_id);
            Ok(())
        })?;
        debug!("{package}: discarded local copy");
        Ok(())
    }

    fn download(&self, package: &PackageReference, remote: &str) -> Result<(), CoreError> {
        validate_transition(package, self.package_state(package)?, PackageState::Published)?;
        self.sync.download_package(package, remote)?;
        Ok(())
    }

    fn build_package(
        &self,
        package: &PackageReference,
        config: &BinaryConfig,
        callbacks: &dyn RecipeCallbacks,
        cancel: &CancelToken,
    ) -> Result<(), CoreError> {
        let reference = &package.recipe;
        self.ensure_export_sources(reference)?;
        self.ensure_source(reference, callbacks, cancel)?;

        let previous = self.package_state(package)?;
        validate_transition(package, previous, PackageState::Building)?;
        self.store
            .set_package_state(package, PackageState::Building)?;

        let result = self.run_build(package, config, callbacks, cancel);
        if result.is_err() {
            if let Err(e) = self.abort_build(package, previous) {
                warn!("{package}: could not restore package state: {e}");
            }
        }
        result
    }

    fn run_build(
        &self,
        package: &PackageReference,
        config: &BinaryConfig,
        callbacks: &dyn RecipeCallbacks,
        cancel: &CancelToken,
    ) -> Result<(), CoreError> {
        let reference = &package.recipe;
        let export_dir = self.store.recipe_path(reference, RecipeFolder::Export);
        let source_dir = self.store.recipe_path(reference, RecipeFolder::Source);
        let build_dir = self.store.package_path(package, PackageFolder::Build);
        remove_dir_if_exists(&build_dir)?;
        fs::create_dir_all(&build_dir)?;

        cancel.check(&format!("build of {package}"))?;
        callbacks
            .build(&BuildContext {
                package,
                config,
                export_dir: &export_dir,
                source_dir: &source_dir,
                build_dir: &build_dir,
                cancel,
            })
            .map_err(|e| stage_failure(package, "build", &e, cancel))?;

        cancel.check(&format!("packaging of {package}"))?;
        let staged = self.store.staging()?;
        callbacks
            .package(&PackageContext {
                package,
                config,
                export_dir: &export_dir,
                build_dir: &build_dir,
                package_dir: staged.path(),
                cancel,
            })
            .map_err(|e| stage_failure(package, "package", &e, cancel))?;

        PackageInfo::new(config.clone(), self.store.recipe_hash(reference)?).save(staged.path())?;
        let manifest = staged.manifest()?;
        validate_transition(package, Some(PackageState::Building), PackageState::Packaged)?;
        self.store
            .commit_package(package, staged, &manifest, PackageState::Packaged)?;
        info!("{package}: packaged ({} files)", manifest.file_sums.len());
        Ok(())
    }

    /// Put the package record back as it was before a failed build. An
    /// interrupted earlier build is not restored.
    fn abort_build(
        &self,
        package: &PackageReference,
        previous: Option<PackageState>,
    ) -> Result<(), CoreError> {
        self.store.update_metadata(&package.recipe, |m| {
            match previous.filter(|s| *s != PackageState::Building) {
                Some(state) => {
                    m.packages.insert(package.package_id.clone(), state);
                }
                None => {
                    m.packages.remove(&package.package_id);
                }
            }
            Ok(())
        })?;
        Ok(())
    }

    fn ensure_export_sources(&self, reference: &RecipeReference) -> Result<(), CoreError> {
        if self.store.metadata(reference)?.export_sources {
            return Ok(());
        }
        if self
            .store
            .export_manifest(reference)?
            .has_dir(EXPORT_SOURCES_DIR)
        {
            self.sync.fetch_export_sources(reference, None)?;
        }
        Ok(())
    }

    fn source_populated(&self, reference: &RecipeReference) -> Result<bool, CoreError> {
        Ok(self.store.metadata(reference)?.source == SourceState::Populated
            && self
                .store
                .recipe_path(reference, RecipeFolder::Source)
                .is_dir())
    }

    /// Run the source stage once per recipe.
    fn ensure_source(
        &self,
        reference: &RecipeReference,
        callbacks: &dyn RecipeCallbacks,
        cancel: &CancelToken,
    ) -> Result<(), CoreError> {
        if self.source_populated(reference)? {
            return Ok(());
        }
        cancel.check(&format!("source of {reference}"))?;
        let export_dir = self.store.recipe_path(reference, RecipeFolder::Export);
        let staged = self.store.staging()?;
        callbacks
            .source(&SourceContext {
                reference,
                export_dir: &export_dir,
                export_sources_dir: &export_dir.join(EXPORT_SOURCES_DIR),
                source_dir: staged.path(),
                cancel,
            })
            .map_err(|e| stage_failure(reference, "source", &e, cancel))?;

        if self.source_populated(reference)? {
            debug!("{reference}: source populated concurrently, keeping that one");
            return Ok(());
        }
        self.store.commit_source(reference, staged)?;
        info!("{reference}: source populated");
        Ok(())
    }

    // --- upload ---

    pub fn upload(&self, request: &UploadRequest) -> Result<Vec<UploadReport>, CoreError> {
        let pattern = RefPattern::new(&request.pattern)?;
        let exact = pattern.as_reference();
        if !request.packages.is_empty() && exact.is_none() {
            return Err(CoreError::InvalidRequest(format!(
                "a package filter needs an exact recipe reference, not '{pattern}'"
            )));
        }

        let references = match exact {
            Some(reference) => {
                if !self.store.exists(&reference) {
                    return Err(StoreError::NotFound(format!("recipe {reference}")).into());
                }
                vec![reference]
            }
            None => {
                let mut refs: Vec<RecipeReference> = self.store.list(&pattern).collect();
                refs.sort();
                if refs.is_empty() {
                    return Err(StoreError::NotFound(format!(
                        "no cached recipe matches '{pattern}'"
                    ))
                    .into());
                }
                if refs.len() > 1 && !request.confirm {
                    return Err(CoreError::Conflict(format!(
                        "'{pattern}' matches {} recipes; confirm to upload all of them",
                        refs.len()
                    )));
                }
                refs
            }
        };

        let remote = self.resolve_remote(request.remote.as_deref())?;
        let retry = RetryPolicy::new(
            request.retry.unwrap_or(self.settings.upload.retry),
            Duration::from_secs(request.retry_wait.unwrap_or(self.settings.upload.retry_wait)),
        );
        let sync = SyncEngine::new(self.store.clone(), Arc::clone(&self.connector)).with_retry(retry);
        let options = UploadOptions {
            all_packages: request.all_packages,
            packages: request.packages.clone(),
            force: request.force,
        };

        let mut reports = Vec::with_capacity(references.len());
        for reference in &references {
            reports.push(sync.upload(reference, &remote, &options)?);
        }
        Ok(reports)
    }

    fn resolve_remote(&self, explicit: Option<&str>) -> Result<String, CoreError> {
        if let Some(name) = explicit {
            return Ok(name.to_owned());
        }
        self.sync
            .registry()
            .load()?
            .default_remote()
            .map(|r| r.name.clone())
            .ok_or_else(|| CoreError::InvalidRequest("no remote is configured".to_owned()))
    }

    // --- remove / copy ---

    /// Remove matching recipes, or parts of them, from the local cache.
    /// Whole-recipe removal also forgets their provenance.
    pub fn remove(
        &self,
        pattern: &str,
        scope: &RemoveScope,
        force: bool,
    ) -> Result<RemoveReport, CoreError> {
        let pattern = RefPattern::new(pattern)?;
        let report = self.store.remove(&pattern, scope, force)?;
        if !report.recipes.is_empty() {
            self.sync.registry().update(|reg| {
                for reference in &report.recipes {
                    reg.clear_provenance(reference);
                }
                Ok(())
            })?;
        }
        Ok(report)
    }

    /// Remove matching recipes, or some of their packages, from a remote.
    /// `Some(&[])` removes every package but keeps the recipe.
    pub fn remove_on_remote(
        &self,
        pattern: &str,
        remote: &str,
        packages: Option<&[PackageId]>,
        force: bool,
    ) -> Result<Vec<RecipeReference>, CoreError> {
        let pattern = RefPattern::new(pattern)?;
        let matches = self.sync.search(remote, &pattern)?;
        if matches.is_empty() {
            return Err(RemoteError::NotFound(format!(
                "no recipe on '{remote}' matches '{pattern}'"
            ))
            .into());
        }
        if matches.len() > 1 && !force {
            return Err(CoreError::Conflict(format!(
                "'{pattern}' matches {} recipes on '{remote}'; use force to remove them all",
                matches.len()
            )));
        }
        for reference in &matches {
            let ids = match packages {
                Some([]) => Some(self.sync.remote_package_ids(reference, remote)?),
                Some(ids) => Some(ids.to_vec()),
                None => None,
            };
            self.sync.remove_remote(reference, remote, ids.as_deref())?;
        }
        Ok(matches)
    }

    /// Copy a cached recipe to another user/channel. `packages` selects
    /// packages to copy along: `None` for none, `Some(&[])` for all.
    pub fn copy(
        &self,
        source: &RecipeReference,
        user: &str,
        channel: &str,
        packages: Option<&[PackageId]>,
        force: bool,
    ) -> Result<CopyReport, CoreError> {
        if !self.store.exists(source) {
            return Err(StoreError::NotFound(format!("recipe {source}")).into());
        }
        let dest = source.with_user_channel(user, channel)?;
        if dest == *source {
            return Err(CoreError::InvalidRequest(format!(
                "{source} is already in {user}/{channel}"
            )));
        }
        if self.store.exists(&dest) && !force {
            return Err(CoreError::Conflict(format!(
                "{dest} already exists; use force to overwrite it"
            )));
        }
        let ids = match packages {
            None => Vec::new(),
            Some([]) => self.store.package_ids(source)?,
            Some(ids) => ids.to_vec(),
        };
        for id in &ids {
            let package = source.package(id.clone());
            if !self.store.package_exists(&package) {
                return Err(StoreError::NotFound(format!("package {package}")).into());
            }
        }

        self.ensure_export_sources(source)?;
        let manifest = self.store.export_manifest(source)?;
        let staged = self.store.staging()?;
        copy_dir(&self.store.recipe_path(source, RecipeFolder::Export), staged.path())?;
        self.store
            .commit_recipe(&dest, staged, &manifest, RecipeState::Exported, true)?;

        for id in &ids {
            let from = source.package(id.clone());
            let manifest = self.store.package_manifest(&from)?;
            let staged = self.store.staging()?;
            copy_dir(&self.store.package_path(&from, PackageFolder::Package), staged.path())?;
            self.store.commit_package(
                &dest.package(id.clone()),
                staged,
                &manifest,
                PackageState::Packaged,
            )?;
        }
        info!("copied {source} to {dest} with {} packages", ids.len());
        Ok(CopyReport {
            reference: dest,
            packages: ids,
        })
    }

    // --- queries ---

    /// Search the local cache, or `remote` when given.
    pub fn search(
        &self,
        pattern: &str,
        remote: Option<&str>,
        case_insensitive: bool,
    ) -> Result<Vec<RecipeReference>, CoreError> {
        let mut pattern = RefPattern::new(pattern)?;
        if case_insensitive {
            pattern = pattern.case_insensitive();
        }
        if let Some(remote) = remote {
            return Ok(self.sync.search(remote, &pattern)?);
        }
        let mut refs: Vec<RecipeReference> = self.store.list(&pattern).collect();
        refs.sort();
        Ok(refs)
    }

    pub fn info(&self, reference: &RecipeReference) -> Result<RecipeInfo, CoreError> {
        let meta = self.store.metadata(reference)?;
        let hash = self.store.recipe_hash(reference)?;
        let remote = self
            .sync
            .registry()
            .load()?
            .provenance(reference)
            .map(str::to_owned);

        let mut packages = Vec::new();
        for id in self.store.package_ids(reference)? {
            let info = self.store.package_info(&reference.package(id.clone())).ok();
            packages.push(PackageSummary {
                state: meta.package_state(&id),
                outdated: info.as_ref().is_some_and(|i| i.recipe_hash != hash),
                config: info.map(|i| i.config),
                id,
            });
        }
        Ok(RecipeInfo {
            reference: reference.clone(),
            state: meta.recipe,
            export_sources: meta.export_sources,
            source: meta.source,
            remote,
            packages,
        })
    }

    /// Compare every matching cached recipe with its provenance remote.
    pub fn check_updates(
        &self,
        pattern: &str,
    ) -> Result<Vec<(RecipeReference, UpdateStatus)>, CoreError> {
        let pattern = RefPattern::new(pattern)?;
        let mut refs: Vec<RecipeReference> = self.store.list(&pattern).collect();
        refs.sort();
        let mut out = Vec::with_capacity(refs.len());
        for reference in refs {
            let status = self.sync.check_updates(&reference)?;
            out.push((reference, status));
        }
        Ok(out)
    }

    pub fn verify(&self, pattern: &str) -> Result<IntegrityReport, CoreError> {
        let pattern = RefPattern::new(pattern)?;
        Ok(verify_cache_integrity(&self.store, &pattern)?)
    }

    pub fn gc(&self, dry_run: bool, cancel: &CancelToken) -> Result<GcReport, CoreError> {
        let gc = GarbageCollector::new(self.store.layout().clone());
        let report = gc.collect_with_cancel(dry_run, STAGING_GRACE, || cancel.is_cancelled())?;
        cancel.check("garbage collection")?;
        Ok(report)
    }

    // --- registry ---

    pub fn registry_remotes(&self) -> Result<Vec<Remote>, CoreError> {
        Ok(self.sync.registry().load()?.remotes().to_vec())
    }

    pub fn registry_add(&self, remote: Remote, position: Option<usize>) -> Result<(), CoreError> {
        info!("adding remote '{}' at {}", remote.name, remote.url);
        Ok(self.sync.registry().update(|reg| reg.add(remote, position))?)
    }

    pub fn registry_remove(&self, name: &str) -> Result<Remote, CoreError> {
        Ok(self.sync.registry().update(|reg| reg.remove(name))?)
    }

    pub fn registry_update(&self, name: &str, url: &str, verify_ssl: bool) -> Result<(), CoreError> {
        Ok(self
            .sync
            .registry()
            .update(|reg| reg.update(name, url, verify_ssl))?)
    }

    pub fn registry_references(&self) -> Result<Vec<(RecipeReference, String)>, CoreError> {
        Ok(self
            .sync
            .registry()
            .load()?
            .provenance_entries()
            .map(|(r, n)| (r.clone(), n.to_owned()))
            .collect())
    }

    /// Point a cached recipe at `remote`, e.g. to resolve an orphaned entry.
    pub fn registry_set_reference(
        &self,
        reference: &RecipeReference,
        remote: &str,
    ) -> Result<(), CoreError> {
        if !self.store.exists(reference) {
            return Err(StoreError::NotFound(format!("recipe {reference}")).into());
        }
        Ok(self
            .sync
            .registry()
            .update(|reg| reg.set_provenance(reference, remote))?)
    }

    pub fn registry_remove_reference(&self, reference: &RecipeReference) -> Result<bool, CoreError> {
        Ok(self
            .sync
            .registry()
            .update(|reg| Ok(reg.clear_provenance(reference)))?)
    }
}

fn exact(reference: &RecipeReference) -> Result<RefPattern, CoreError> {
    Ok(RefPattern::new(&reference.to_string())?)
}

fn stage_failure(
    subject: &dyn Display,
    stage: &str,
    error: &BoxError,
    cancel: &CancelToken,
) -> CoreError {
    if cancel.is_cancelled() {
        return CoreError::Cancelled(format!("{stage} of {subject}"));
    }
    CoreError::BuildFailed {
        package: subject.to_string(),
        stage: stage.to_owned(),
        reason: error.to_string(),
    }
}

fn copy_file(from: &Path, to: &Path) -> Result<(), CoreError> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::copy(from, to)?;
    Ok(())
}

/// Copy files under `root` matching any of `globs` into `dest`, keeping
/// their relative paths. Returns the number of files copied.
fn copy_matching(root: &Path, globs: &[String], dest: &Path) -> Result<usize, CoreError> {
    if globs.is_empty() {
        return Ok(0);
    }
    let patterns = globs
        .iter()
        .map(|g| glob::Pattern::new(g))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CoreError::InvalidRequest(format!("invalid export pattern: {}", e.msg)))?;
    let mut copied = 0;
    for entry in walk(root, &|_, _| false)? {
        if entry.is_dir || entry.rel == RECIPE_FILE {
            continue;
        }
        if patterns.iter().any(|p| p.matches(&entry.rel)) {
            copy_file(&entry.path, &dest.join(&entry.rel))?;
            copied += 1;
        }
    }
    Ok(copied)
}
