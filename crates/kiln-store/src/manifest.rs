//! Per-folder content manifests.
//!
//! A manifest is a wall-clock timestamp plus a sorted map of relative file
//! path to blake3 checksum. Its text form is the timestamp on the first line
//! followed by one `path: checksum` line per file, sorted by path, so two
//! computations over unchanged content serialize identically apart from the
//! timestamp.

use crate::archive::ArchiveKind;
use crate::fsutil::{walk, write_atomic};
use crate::StoreError;
use kiln_schema::{Checksum, RecipeHash};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io::Read;
use std::path::Path;
use tracing::debug;

/// Manifest file name inside an export or package folder.
pub const MANIFEST_FILE: &str = "conanmanifest.txt";

/// Sub-folder of `export/` holding the separately synchronized sources.
pub const EXPORT_SOURCES_DIR: &str = "export_source";

const EXCLUDED_DIRS: &[&str] = &["__pycache__"];
const EXCLUDED_SUFFIXES: &[&str] = &[".pyc", ".pyo"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Seconds since the Unix epoch when the manifest was computed.
    pub time: u64,
    pub file_sums: BTreeMap<String, Checksum>,
}

/// Paths that differ between two manifests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
}

impl ManifestDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

impl std::fmt::Display for ManifestDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for p in &self.added {
            writeln!(f, "+ {p}")?;
        }
        for p in &self.removed {
            writeln!(f, "- {p}")?;
        }
        for p in &self.modified {
            writeln!(f, "~ {p}")?;
        }
        Ok(())
    }
}

/// Transient artifacts never tracked by a manifest.
fn is_excluded(rel: &str, is_dir: bool) -> bool {
    let name = rel.rsplit('/').next().unwrap_or(rel);
    if is_dir {
        return EXCLUDED_DIRS.contains(&name);
    }
    if EXCLUDED_SUFFIXES.iter().any(|s| name.ends_with(s)) {
        return true;
    }
    // The manifest itself and transfer archives only at the top level.
    !rel.contains('/') && (rel == MANIFEST_FILE || ArchiveKind::from_file_name(rel).is_some())
}

pub(crate) fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

fn file_checksum(path: &Path) -> Result<Checksum, StoreError> {
    let mut hasher = blake3::Hasher::new();
    let mut file = fs::File::open(path)?;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Checksum::new(hasher.finalize().to_hex().to_string()))
}

impl Manifest {
    pub fn new(time: u64, file_sums: BTreeMap<String, Checksum>) -> Self {
        Self { time, file_sums }
    }

    /// Checksum every regular file under `folder`, stamped with the current time.
    ///
    /// A missing folder is `NotFound`, never an empty manifest.
    pub fn compute(folder: &Path) -> Result<Self, StoreError> {
        if !folder.is_dir() {
            return Err(StoreError::NotFound(folder.display().to_string()));
        }
        let mut file_sums = BTreeMap::new();
        for entry in walk(folder, &is_excluded)? {
            if !entry.is_dir {
                file_sums.insert(entry.rel, file_checksum(&entry.path)?);
            }
        }
        debug!("manifest of {}: {} files", folder.display(), file_sums.len());
        Ok(Self {
            time: now_secs(),
            file_sums,
        })
    }

    pub fn serialize(&self) -> String {
        let mut out = format!("{}\n", self.time);
        for (path, sum) in &self.file_sums {
            let _ = writeln!(out, "{path}: {sum}");
        }
        out
    }

    pub fn parse(text: &str) -> Result<Self, StoreError> {
        let mut lines = text.lines().enumerate();
        let (_, first) = lines.next().ok_or(StoreError::InvalidManifest {
            line: 1,
            reason: "empty manifest".to_owned(),
        })?;
        let time = first
            .trim()
            .parse::<u64>()
            .map_err(|e| StoreError::InvalidManifest {
                line: 1,
                reason: format!("bad timestamp: {e}"),
            })?;

        let mut file_sums = BTreeMap::new();
        for (idx, line) in lines {
            if line.trim().is_empty() {
                continue;
            }
            let (path, sum) = line
                .rsplit_once(": ")
                .ok_or_else(|| StoreError::InvalidManifest {
                    line: idx + 1,
                    reason: "expected 'path: checksum'".to_owned(),
                })?;
            if path.is_empty() || sum.trim().is_empty() {
                return Err(StoreError::InvalidManifest {
                    line: idx + 1,
                    reason: "empty path or checksum".to_owned(),
                });
            }
            file_sums.insert(path.to_owned(), Checksum::new(sum.trim()));
        }
        Ok(Self { time, file_sums })
    }

    /// Read `folder/conanmanifest.txt`.
    pub fn load(folder: &Path) -> Result<Self, StoreError> {
        let path = folder.join(MANIFEST_FILE);
        match fs::read_to_string(&path) {
            Ok(text) => Self::parse(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write `folder/conanmanifest.txt` atomically.
    pub fn save(&self, folder: &Path) -> Result<(), StoreError> {
        write_atomic(&folder.join(MANIFEST_FILE), self.serialize().as_bytes())
    }

    /// What changed going from `self` to `newer`.
    pub fn diff(&self, newer: &Manifest) -> ManifestDiff {
        let mut diff = ManifestDiff::default();
        for (path, sum) in &newer.file_sums {
            match self.file_sums.get(path) {
                None => diff.added.push(path.clone()),
                Some(old) if old != sum => diff.modified.push(path.clone()),
                Some(_) => {}
            }
        }
        for path in self.file_sums.keys() {
            if !newer.file_sums.contains_key(path) {
                diff.removed.push(path.clone());
            }
        }
        diff
    }

    /// Same tracked files with the same checksums; timestamps are ignored.
    pub fn same_content(&self, other: &Manifest) -> bool {
        self.file_sums == other.file_sums
    }

    /// blake3 over the checksum map only, independent of the timestamp.
    pub fn fingerprint(&self) -> RecipeHash {
        let mut hasher = blake3::Hasher::new();
        for (path, sum) in &self.file_sums {
            hasher.update(path.as_bytes());
            hasher.update(b": ");
            hasher.update(sum.as_bytes());
            hasher.update(b"\n");
        }
        RecipeHash::new(hasher.finalize().to_hex().to_string())
    }

    /// Copy of this manifest without entries under `prefix/`.
    #[must_use]
    pub fn without_dir(&self, prefix: &str) -> Manifest {
        let lead = format!("{prefix}/");
        Manifest {
            time: self.time,
            file_sums: self
                .file_sums
                .iter()
                .filter(|(p, _)| !p.starts_with(&lead))
                .map(|(p, s)| (p.clone(), s.clone()))
                .collect(),
        }
    }

    /// Entries under `prefix/`, re-rooted at that folder.
    #[must_use]
    pub fn subtree(&self, prefix: &str) -> Manifest {
        let lead = format!("{prefix}/");
        Manifest {
            time: self.time,
            file_sums: self
                .file_sums
                .iter()
                .filter_map(|(p, s)| p.strip_prefix(&lead).map(|rel| (rel.to_owned(), s.clone())))
                .collect(),
        }
    }

    pub fn has_dir(&self, prefix: &str) -> bool {
        let lead = format!("{prefix}/");
        self.file_sums.keys().any(|p| p.starts_with(&lead))
    }
}
