use crate::RemoteError;
use kiln_schema::RecipeReference;
use kiln_store::fsutil::write_atomic;
use kiln_store::{CacheLayout, RefLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Remote {
    pub name: String,
    pub url: String,
    #[serde(default = "default_verify_ssl")]
    pub verify_ssl: bool,
}

fn default_verify_ssl() -> bool {
    true
}

impl Remote {
    pub fn new(name: &str, url: &str, verify_ssl: bool) -> Self {
        Self {
            name: name.to_owned(),
            url: url.trim_end_matches('/').to_owned(),
            verify_ssl,
        }
    }
}

/// Ordered remote list plus the provenance map.
///
/// Provenance is advisory: it names the remote a recipe was last pulled
/// from or pushed to, so lookups start there instead of querying every
/// remote. Removing a remote leaves its provenance entries in place.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Registry {
    #[serde(default)]
    remotes: Vec<Remote>,
    #[serde(default)]
    references: BTreeMap<RecipeReference, String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, RemoteError> {
        serde_json::from_slice(data)
            .map_err(|e| RemoteError::Serialization(format!("invalid registry: {e}")))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, RemoteError> {
        serde_json::to_vec_pretty(self).map_err(|e| RemoteError::Serialization(e.to_string()))
    }

    pub fn remotes(&self) -> &[Remote] {
        &self.remotes
    }

    pub fn get(&self, name: &str) -> Option<&Remote> {
        self.remotes.iter().find(|r| r.name == name)
    }

    /// The first configured remote.
    pub fn default_remote(&self) -> Option<&Remote> {
        self.remotes.first()
    }

    /// Append a remote, or insert it at `position` in the lookup order.
    pub fn add(&mut self, remote: Remote, position: Option<usize>) -> Result<(), RemoteError> {
        if remote.name.trim().is_empty() {
            return Err(RemoteError::Config("remote name cannot be empty".to_owned()));
        }
        if remote.url.is_empty() {
            return Err(RemoteError::Config(format!(
                "remote '{}' needs a URL",
                remote.name
            )));
        }
        if self.get(&remote.name).is_some() {
            return Err(RemoteError::Conflict(format!(
                "remote '{}' already exists",
                remote.name
            )));
        }
        match position {
            Some(i) => self.remotes.insert(i.min(self.remotes.len()), remote),
            None => self.remotes.push(remote),
        }
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<Remote, RemoteError> {
        let idx = self.position(name)?;
        Ok(self.remotes.remove(idx))
    }

    pub fn update(&mut self, name: &str, url: &str, verify_ssl: bool) -> Result<(), RemoteError> {
        let idx = self.position(name)?;
        self.remotes[idx] = Remote::new(name, url, verify_ssl);
        Ok(())
    }

    fn position(&self, name: &str) -> Result<usize, RemoteError> {
        self.remotes
            .iter()
            .position(|r| r.name == name)
            .ok_or_else(|| RemoteError::NotFound(format!("remote '{name}'")))
    }

    pub fn provenance(&self, reference: &RecipeReference) -> Option<&str> {
        self.references.get(reference).map(String::as_str)
    }

    /// Provenance that names a remote which is still configured.
    pub fn provenance_remote(&self, reference: &RecipeReference) -> Option<&Remote> {
        self.provenance(reference).and_then(|name| self.get(name))
    }

    pub fn is_orphaned(&self, reference: &RecipeReference) -> bool {
        self.provenance(reference)
            .is_some_and(|name| self.get(name).is_none())
    }

    pub fn set_provenance(
        &mut self,
        reference: &RecipeReference,
        remote: &str,
    ) -> Result<(), RemoteError> {
        self.position(remote)?;
        self.references.insert(reference.clone(), remote.to_owned());
        Ok(())
    }

    pub fn clear_provenance(&mut self, reference: &RecipeReference) -> bool {
        self.references.remove(reference).is_some()
    }

    pub fn provenance_entries(&self) -> impl Iterator<Item = (&RecipeReference, &str)> {
        self.references.iter().map(|(r, n)| (r, n.as_str()))
    }
}

/// `registry.json` at the cache root, rewritten under `locks/registry.lock`.
#[derive(Debug, Clone)]
pub struct RegistryFile {
    path: PathBuf,
    lock_path: PathBuf,
}

impl RegistryFile {
    pub fn new(layout: &CacheLayout) -> Self {
        Self {
            path: layout.registry_file(),
            lock_path: layout.registry_lock_file(),
        }
    }

    /// A missing file is an empty registry.
    pub fn load(&self) -> Result<Registry, RemoteError> {
        match std::fs::read(&self.path) {
            Ok(data) => Registry::from_bytes(&data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Registry::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read-modify-write under the registry lock. Nothing is written when
    /// `f` fails.
    pub fn update<T, F>(&self, f: F) -> Result<T, RemoteError>
    where
        F: FnOnce(&mut Registry) -> Result<T, RemoteError>,
    {
        let _lock = RefLock::acquire(&self.lock_path)?;
        let mut registry = self.load()?;
        let out = f(&mut registry)?;
        write_atomic(&self.path, &registry.to_bytes()?)?;
        debug!("registry saved to {}", self.path.display());
        Ok(out)
    }
}
