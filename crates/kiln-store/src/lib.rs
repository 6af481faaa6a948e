//! Local cache for kiln: layout, manifests, transfer archives, and status records.
//!
//! `CacheLayout` owns every path under the cache root. `Manifest` computes and
//! compares per-folder checksum manifests; `archive` packs folders into
//! deterministic gzip tarballs and stages them back with an atomic replace.
//! `LocalStore` ties these together with per-reference locks and the
//! checksummed `metadata.json` status record kept beside each recipe.

pub mod archive;
pub mod cache;
pub mod fsutil;
pub mod gc;
pub mod info;
pub mod integrity;
pub mod layout;
pub mod lock;
pub mod manifest;
pub mod metadata;

pub use archive::{pack, stage, ArchiveKind, StagedFolder};
pub use cache::{LocalStore, RecipeIter, RemoveReport, RemoveScope};
pub use gc::{GarbageCollector, GcReport};
pub use info::{PackageInfo, INFO_FILE};
pub use integrity::{verify_cache_integrity, IntegrityFailure, IntegrityReport};
pub use layout::{CacheLayout, PackageFolder, RecipeFolder, CACHE_FORMAT_VERSION};
pub use lock::RefLock;
pub use manifest::{Manifest, ManifestDiff, EXPORT_SOURCES_DIR, MANIFEST_FILE};
pub use metadata::{PackageState, RecipeMetadata, RecipeState, SourceState};

use std::path::Path;
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("integrity check failed for {subject}: {reason}")]
    Integrity { subject: String, reason: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid manifest at line {line}: {reason}")]
    InvalidManifest { line: usize, reason: String },
    #[error("invalid package info: {0}")]
    InvalidInfo(String),
    #[error("rejected archive: {0}")]
    InvalidArchive(String),
    #[error("lock acquisition failed: {0}")]
    LockFailed(String),
    #[error("cache format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Schema(#[from] kiln_schema::SchemaError),
}

impl StoreError {
    pub(crate) fn integrity(subject: impl ToString, reason: impl Into<String>) -> Self {
        Self::Integrity {
            subject: subject.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_display_not_found() {
        let e = StoreError::NotFound("Hello/0.1@lasote/testing".to_owned());
        assert!(e.to_string().contains("Hello/0.1@lasote/testing"));
        assert!(e.is_not_found());
    }

    #[test]
    fn store_error_display_integrity() {
        let e = StoreError::integrity("Hello/0.1@lasote/testing:abc", "hello.h modified");
        let msg = e.to_string();
        assert!(msg.contains("abc"));
        assert!(msg.contains("hello.h modified"));
        assert!(!e.is_not_found());
    }

    #[test]
    fn store_error_display_version_mismatch() {
        let e = StoreError::VersionMismatch {
            expected: 1,
            found: 7,
        };
        let msg = e.to_string();
        assert!(msg.contains('1'));
        assert!(msg.contains('7'));
    }

    #[test]
    fn store_error_display_invalid_manifest() {
        let e = StoreError::InvalidManifest {
            line: 3,
            reason: "missing ': '".to_owned(),
        };
        assert!(e.to_string().contains("line 3"));
    }
}
