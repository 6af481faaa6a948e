use crate::fsutil::write_atomic;
use crate::StoreError;
use kiln_schema::{PackageId, RecipeReference};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecipeState {
    /// Created locally by an export.
    Exported,
    /// Fetched from a remote.
    Downloaded,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceState {
    #[default]
    Absent,
    Populated,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PackageState {
    Building,
    Packaged,
    Published,
}

impl std::fmt::Display for RecipeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecipeState::Exported => write!(f, "exported"),
            RecipeState::Downloaded => write!(f, "downloaded"),
        }
    }
}

impl std::fmt::Display for SourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceState::Absent => write!(f, "absent"),
            SourceState::Populated => write!(f, "populated"),
        }
    }
}

impl std::fmt::Display for PackageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PackageState::Building => write!(f, "building"),
            PackageState::Packaged => write!(f, "packaged"),
            PackageState::Published => write!(f, "published"),
        }
    }
}

/// Sidecar status record kept as `metadata.json` beside each recipe's folders.
///
/// Lifecycle questions ("are sources populated?", "is this package finished?")
/// are answered from here instead of from folder existence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecipeMetadata {
    pub reference: RecipeReference,
    pub recipe: RecipeState,
    /// Whether `export/export_source/` is materialized locally.
    #[serde(default)]
    pub export_sources: bool,
    #[serde(default)]
    pub source: SourceState,
    #[serde(default)]
    pub packages: BTreeMap<PackageId, PackageState>,
    pub updated_at: String,
    /// blake3 checksum of this record with the field itself unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl RecipeMetadata {
    pub fn new(reference: RecipeReference, recipe: RecipeState) -> Self {
        Self {
            reference,
            recipe,
            export_sources: false,
            source: SourceState::Absent,
            packages: BTreeMap::new(),
            updated_at: chrono::Utc::now().to_rfc3339(),
            checksum: None,
        }
    }

    pub fn package_state(&self, id: &PackageId) -> Option<PackageState> {
        self.packages.get(id).copied()
    }

    fn compute_checksum(&self) -> Result<String, StoreError> {
        let mut copy = self.clone();
        copy.checksum = None;
        let json = serde_json::to_string_pretty(&copy)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }

    /// Read and verify a record. A missing file is `NotFound`; a checksum
    /// mismatch is `Integrity`.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let meta: RecipeMetadata = serde_json::from_str(&content)?;
        if let Some(ref expected) = meta.checksum {
            let actual = meta.compute_checksum()?;
            if actual != *expected {
                return Err(StoreError::integrity(
                    &meta.reference,
                    format!("status record checksum mismatch: expected {expected}, got {actual}"),
                ));
            }
        }
        Ok(meta)
    }

    /// Stamp, checksum, and atomically write the record.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let mut stamped = self.clone();
        stamped.updated_at = chrono::Utc::now().to_rfc3339();
        stamped.checksum = None;
        stamped.checksum = Some(stamped.compute_checksum()?);
        let content = serde_json::to_string_pretty(&stamped)?;
        write_atomic(path, content.as_bytes())
    }
}
