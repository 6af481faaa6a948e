//! Upload, download, and update checks between the local cache and remotes.
//!
//! Transfers never hold a cache lock: archives are packed from the live
//! folders and downloads are extracted into the staging area, verified
//! against the manifest the remote delivered, and only then committed by
//! `LocalStore` under the reference's lock. A manifest is always the last
//! object written on upload, so a remote never advertises content it does
//! not have.

use crate::client::RemoteClient;
use crate::registry::{Registry, RegistryFile, Remote};
use crate::retry::RetryPolicy;
use crate::transport::Connector;
use crate::RemoteError;
use kiln_schema::{PackageId, PackageReference, RecipeReference, RefPattern};
use kiln_store::{
    pack, ArchiveKind, LocalStore, Manifest, ManifestDiff, PackageFolder, PackageState,
    RecipeFolder, RecipeState, RemoveScope, EXPORT_SOURCES_DIR,
};
use std::fmt::Display;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// Upload every local package of the recipe.
    pub all_packages: bool,
    /// Upload only these packages. Takes precedence over `all_packages`.
    pub packages: Vec<PackageId>,
    /// Re-upload unchanged content, overwrite newer remote recipes, and
    /// recompute manifests of folders modified after they were written.
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipeOutcome {
    Uploaded,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageOutcome {
    Uploaded,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct UploadReport {
    pub reference: RecipeReference,
    pub remote: String,
    pub recipe: RecipeOutcome,
    pub packages: Vec<(PackageId, PackageOutcome)>,
}

impl UploadReport {
    /// Whether anything was sent.
    pub fn transferred(&self) -> bool {
        self.recipe == RecipeOutcome::Uploaded
            || self
                .packages
                .iter()
                .any(|(_, o)| *o == PackageOutcome::Uploaded)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStatus {
    UpToDate { remote: String },
    /// The remote copy differs and is strictly newer.
    UpdateAvailable { remote: String, diff: ManifestDiff },
    /// The remote copy differs but is not newer than the local one.
    LocalNewer { remote: String },
    NotOnRemote { remote: String },
    /// No provenance, or provenance names a remote that was removed.
    NoRemote,
}

pub struct SyncEngine {
    store: LocalStore,
    registry: RegistryFile,
    connector: Arc<dyn Connector>,
    retry: RetryPolicy,
}

fn verify_delivery(
    subject: &dyn Display,
    unpacked: &Manifest,
    delivered: &Manifest,
) -> Result<(), RemoteError> {
    if unpacked.same_content(delivered) {
        return Ok(());
    }
    Err(RemoteError::integrity(
        subject,
        format!(
            "unpacked content does not match the delivered manifest ({})",
            delivered.diff(unpacked)
        ),
    ))
}

impl SyncEngine {
    pub fn new(store: LocalStore, connector: Arc<dyn Connector>) -> Self {
        let registry = RegistryFile::new(store.layout());
        Self {
            store,
            registry,
            connector,
            retry: RetryPolicy::NONE,
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn registry(&self) -> &RegistryFile {
        &self.registry
    }

    pub fn client(&self, remote: &str) -> Result<RemoteClient, RemoteError> {
        let registry = self.registry.load()?;
        let remote = registry
            .get(remote)
            .ok_or_else(|| RemoteError::NotFound(format!("remote '{remote}' is not configured")))?;
        self.client_for(remote)
    }

    fn client_for(&self, remote: &Remote) -> Result<RemoteClient, RemoteError> {
        Ok(RemoteClient::new(
            &remote.name,
            self.connector.connect(remote)?,
            self.retry,
        ))
    }

    fn set_provenance(&self, reference: &RecipeReference, remote: &str) -> Result<(), RemoteError> {
        self.registry
            .update(|reg| reg.set_provenance(reference, remote))
    }

    /// The configured remote this recipe came from, warning about orphans.
    fn provenance_remote(
        &self,
        registry: &Registry,
        reference: &RecipeReference,
    ) -> Option<Remote> {
        if registry.is_orphaned(reference) {
            warn!(
                "{reference}: provenance remote '{}' is no longer configured",
                registry.provenance(reference).unwrap_or_default()
            );
        }
        registry.provenance_remote(reference).cloned()
    }

    // --- upload ---

    pub fn upload(
        &self,
        reference: &RecipeReference,
        remote: &str,
        options: &UploadOptions,
    ) -> Result<UploadReport, RemoteError> {
        let client = self.client(remote)?;
        let packages = self.select_packages(reference, options)?;

        let recipe = self.upload_recipe(&client, reference, options.force)?;
        self.set_provenance(reference, remote)?;

        let mut report = UploadReport {
            reference: reference.clone(),
            remote: remote.to_owned(),
            recipe,
            packages: Vec::new(),
        };
        for id in packages {
            let package = reference.package(id);
            let outcome = self.upload_package(&client, &package, options.force)?;
            report.packages.push((package.package_id, outcome));
        }
        info!(
            "{reference}: upload to '{remote}' done ({} packages)",
            report.packages.len()
        );
        Ok(report)
    }

    /// Resolve which packages to send. Explicitly requested ones must exist
    /// and be finished; checks run before anything is transferred.
    fn select_packages(
        &self,
        reference: &RecipeReference,
        options: &UploadOptions,
    ) -> Result<Vec<PackageId>, RemoteError> {
        let meta = self.store.metadata(reference)?;
        let finished = |id: &PackageId| {
            matches!(
                meta.package_state(id),
                Some(PackageState::Packaged | PackageState::Published)
            )
        };

        if !options.packages.is_empty() {
            for id in &options.packages {
                let package = reference.package(id.clone());
                if !self.store.package_exists(&package) {
                    return Err(RemoteError::NotFound(format!("package {package}")));
                }
                if !finished(id) {
                    return Err(RemoteError::Conflict(format!(
                        "package {package} is not fully built"
                    )));
                }
            }
            return Ok(options.packages.clone());
        }
        if !options.all_packages {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for id in self.store.package_ids(reference)? {
            if finished(&id) {
                out.push(id);
            } else {
                warn!("{reference}:{id} is not fully built, skipping");
            }
        }
        Ok(out)
    }

    fn upload_recipe(
        &self,
        client: &RemoteClient,
        reference: &RecipeReference,
        force: bool,
    ) -> Result<RecipeOutcome, RemoteError> {
        let export = self.store.recipe_path(reference, RecipeFolder::Export);
        let manifest = if self.store.is_stale(reference)? {
            if !force {
                return Err(RemoteError::integrity(
                    reference,
                    "export folder was modified after its manifest was written; re-export or upload with force",
                ));
            }
            warn!("{reference}: export changed since its manifest was written, recomputing");
            let current = self.store.compute_export_manifest(reference)?;
            let _lock = self.store.lock(reference)?;
            current.save(&export)?;
            current
        } else {
            self.store.export_manifest(reference)?
        };

        match client.recipe_manifest(reference) {
            Ok(remote) if !force => {
                if remote.same_content(&manifest) {
                    info!("{reference}: recipe unchanged on '{}'", client.name());
                    return Ok(RecipeOutcome::Unchanged);
                }
                if remote.time > manifest.time {
                    return Err(RemoteError::Conflict(format!(
                        "remote '{}' has a newer {reference}; upload with force to overwrite it",
                        client.name()
                    )));
                }
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let with_sources = manifest.has_dir(EXPORT_SOURCES_DIR);
        if with_sources && !self.store.metadata(reference)?.export_sources {
            self.fetch_export_sources(reference, Some(client.name()))?;
        }

        client.put_recipe_archive(reference, ArchiveKind::Export, pack(&export, ArchiveKind::Export)?)?;
        if with_sources {
            let sources = self.store.recipe_path(reference, RecipeFolder::ExportSources);
            client.put_recipe_archive(
                reference,
                ArchiveKind::ExportSources,
                pack(&sources, ArchiveKind::ExportSources)?,
            )?;
        }
        client.put_recipe_manifest(reference, &manifest)?;
        info!("{reference}: recipe uploaded to '{}'", client.name());
        Ok(RecipeOutcome::Uploaded)
    }

    fn upload_package(
        &self,
        client: &RemoteClient,
        package: &PackageReference,
        force: bool,
    ) -> Result<PackageOutcome, RemoteError> {
        let folder = self.store.package_path(package, PackageFolder::Package);
        let manifest = if self.store.package_is_stale(package)? {
            if !force {
                return Err(RemoteError::integrity(
                    package,
                    "package folder was modified after its manifest was written; rebuild it or upload with force",
                ));
            }
            warn!("{package}: package changed since its manifest was written, recomputing");
            let current = Manifest::compute(&folder)?;
            let _lock = self.store.lock(&package.recipe)?;
            current.save(&folder)?;
            current
        } else {
            self.store.package_manifest(package)?
        };

        if !force {
            match client.package_manifest(package) {
                Ok(remote) if remote.same_content(&manifest) => {
                    debug!("{package}: unchanged on '{}'", client.name());
                    self.store
                        .set_package_state(package, PackageState::Published)?;
                    return Ok(PackageOutcome::Unchanged);
                }
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        let info = self.store.package_info(package)?;
        client.put_package_archive(package, pack(&folder, ArchiveKind::Package)?)?;
        client.put_package_info(package, &info)?;
        client.put_package_manifest(package, &manifest)?;
        self.store
            .set_package_state(package, PackageState::Published)?;
        info!("{package}: uploaded to '{}'", client.name());
        Ok(PackageOutcome::Uploaded)
    }

    // --- download ---

    /// Fetch the export folder of a recipe. `export_source/` is left to
    /// [`Self::fetch_export_sources`].
    ///
    /// Returns whether the local export changed. When it did, a previously
    /// populated `source/` is dropped because it no longer matches.
    pub fn download_recipe(
        &self,
        reference: &RecipeReference,
        remote: &str,
    ) -> Result<bool, RemoteError> {
        let client = self.client(remote)?;
        let delivered = client.recipe_manifest(reference)?;
        let data = client.recipe_archive(reference, ArchiveKind::Export)?;
        let staged = self.store.stage_archive(&data)?;
        verify_delivery(
            reference,
            &staged.manifest()?,
            &delivered.without_dir(EXPORT_SOURCES_DIR),
        )?;

        let previous = self.store.export_manifest(reference).ok();
        let changed =
            self.store
                .commit_recipe(reference, staged, &delivered, RecipeState::Downloaded, false)?;
        if changed && previous.is_some_and(|p| !p.same_content(&delivered)) {
            let scope = RemoveScope {
                sources: true,
                ..RemoveScope::default()
            };
            self.store
                .remove(&RefPattern::new(&reference.to_string())?, &scope, true)?;
            debug!("{reference}: recipe changed, dropped its source folder");
        }
        self.set_provenance(reference, remote)?;
        info!("{reference}: recipe downloaded from '{remote}'");
        Ok(changed)
    }

    /// Materialize `export/export_source/` from the recipe's provenance
    /// remote, or `fallback` when it has none.
    pub fn fetch_export_sources(
        &self,
        reference: &RecipeReference,
        fallback: Option<&str>,
    ) -> Result<(), RemoteError> {
        let expected = self
            .store
            .export_manifest(reference)?
            .subtree(EXPORT_SOURCES_DIR);
        let registry = self.registry.load()?;
        let remote = match self.provenance_remote(&registry, reference) {
            Some(r) => r,
            None => fallback
                .and_then(|name| registry.get(name).cloned())
                .ok_or_else(|| {
                    RemoteError::NotFound(format!(
                        "export sources of {reference}: no remote to fetch them from"
                    ))
                })?,
        };

        let client = self.client_for(&remote)?;
        let data = client.recipe_archive(reference, ArchiveKind::ExportSources)?;
        let staged = self.store.stage_archive(&data)?;
        verify_delivery(reference, &staged.manifest()?, &expected)?;
        self.store.commit_export_sources(reference, staged)?;
        info!("{reference}: export sources fetched from '{}'", remote.name);
        Ok(())
    }

    /// Fetch one package. The recipe must already be cached.
    ///
    /// Returns `false` when an identical package was already present, for
    /// instance because a concurrent download won.
    pub fn download_package(
        &self,
        package: &PackageReference,
        remote: &str,
    ) -> Result<bool, RemoteError> {
        let client = self.client(remote)?;
        let delivered = client.package_manifest(package)?;
        let data = client.package_archive(package)?;
        let staged = self.store.stage_archive(&data)?;
        verify_delivery(package, &staged.manifest()?, &delivered)?;
        let committed =
            self.store
                .commit_package(package, staged, &delivered, PackageState::Published)?;
        info!("{package}: downloaded from '{remote}'");
        Ok(committed)
    }

    // --- lookups ---

    /// Which remote to install a recipe from: `explicit` if given, else its
    /// provenance, else the first remote in registry order that has it.
    pub fn locate_recipe(
        &self,
        reference: &RecipeReference,
        explicit: Option<&str>,
    ) -> Result<String, RemoteError> {
        if let Some(name) = explicit {
            return Ok(name.to_owned());
        }
        let registry = self.registry.load()?;
        if let Some(remote) = self.provenance_remote(&registry, reference) {
            return Ok(remote.name);
        }
        for remote in registry.remotes() {
            match self.client_for(remote)?.recipe_manifest(reference) {
                Ok(_) => return Ok(remote.name.clone()),
                Err(e) if e.is_not_found() => debug!("{reference} not on '{}'", remote.name),
                Err(e) => return Err(e),
            }
        }
        Err(RemoteError::NotFound(format!(
            "recipe {reference} in any configured remote"
        )))
    }

    /// The provenance remote of the package's recipe, if it has the package.
    /// Other remotes are never consulted for binaries.
    pub fn package_remote(&self, package: &PackageReference) -> Result<Option<String>, RemoteError> {
        let registry = self.registry.load()?;
        let Some(remote) = self.provenance_remote(&registry, &package.recipe) else {
            return Ok(None);
        };
        let found = self.client_for(&remote)?.has_package(package)?;
        Ok(found.then_some(remote.name))
    }

    /// Compare the local export manifest with the provenance remote's.
    pub fn check_updates(&self, reference: &RecipeReference) -> Result<UpdateStatus, RemoteError> {
        let local = self.store.export_manifest(reference)?;
        let registry = self.registry.load()?;
        let Some(remote) = self.provenance_remote(&registry, reference) else {
            return Ok(UpdateStatus::NoRemote);
        };
        let client = self.client_for(&remote)?;
        let status = match client.recipe_manifest(reference) {
            Ok(theirs) => compare(&local, &theirs, remote.name),
            Err(e) if e.is_not_found() => UpdateStatus::NotOnRemote {
                remote: remote.name,
            },
            Err(e) => return Err(e),
        };
        debug!("{reference}: {status:?}");
        Ok(status)
    }

    /// Same as [`Self::check_updates`] for one package.
    pub fn check_package_updates(
        &self,
        package: &PackageReference,
    ) -> Result<UpdateStatus, RemoteError> {
        let local = self.store.package_manifest(package)?;
        let registry = self.registry.load()?;
        let Some(remote) = self.provenance_remote(&registry, &package.recipe) else {
            return Ok(UpdateStatus::NoRemote);
        };
        match self.client_for(&remote)?.package_manifest(package) {
            Ok(theirs) => Ok(compare(&local, &theirs, remote.name)),
            Err(e) if e.is_not_found() => Ok(UpdateStatus::NotOnRemote {
                remote: remote.name,
            }),
            Err(e) => Err(e),
        }
    }

    pub fn search(
        &self,
        remote: &str,
        pattern: &RefPattern,
    ) -> Result<Vec<RecipeReference>, RemoteError> {
        self.client(remote)?.search(pattern)
    }

    pub fn remote_package_ids(
        &self,
        reference: &RecipeReference,
        remote: &str,
    ) -> Result<Vec<PackageId>, RemoteError> {
        self.client(remote)?.package_ids(reference)
    }

    /// Delete a recipe, or some of its packages, on a remote. Removing the
    /// whole recipe also clears provenance pointing at that remote.
    pub fn remove_remote(
        &self,
        reference: &RecipeReference,
        remote: &str,
        packages: Option<&[PackageId]>,
    ) -> Result<(), RemoteError> {
        let client = self.client(remote)?;
        match packages {
            Some(ids) => {
                for id in ids {
                    client.remove_package(&reference.package(id.clone()))?;
                }
            }
            None => {
                client.remove_recipe(reference)?;
                self.registry.update(|reg| {
                    if reg.provenance(reference) == Some(remote) {
                        reg.clear_provenance(reference);
                    }
                    Ok(())
                })?;
            }
        }
        info!("{reference}: removed from '{remote}'");
        Ok(())
    }
}

fn compare(local: &Manifest, theirs: &Manifest, remote: String) -> UpdateStatus {
    if local.same_content(theirs) {
        UpdateStatus::UpToDate { remote }
    } else if theirs.time > local.time {
        UpdateStatus::UpdateAvailable {
            remote,
            diff: local.diff(theirs),
        }
    } else {
        UpdateStatus::LocalNewer { remote }
    }
}
