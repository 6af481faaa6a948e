//! Transfer archives: deterministic gzip tarballs of one folder each.
//!
//! Packing sorts entries, zeroes mtime and ownership, keeps permission bits,
//! and resolves symlinks to regular files, so repeated packs of unchanged
//! content are byte-identical. Unpacking is split into [`stage`], which
//! extracts into a private directory under the cache's staging area, and
//! [`StagedFolder::commit`], which swaps the result into place by rename.

use crate::fsutil::walk;
use crate::manifest::{Manifest, EXPORT_SOURCES_DIR, MANIFEST_FILE};
use crate::{fsync_dir, StoreError};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path};
use tempfile::TempDir;
use tracing::debug;

/// Which folder an archive carries. The receiver dispatches on the kind it
/// asked for, never on the archive contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveKind {
    Export,
    ExportSources,
    Package,
}

impl ArchiveKind {
    pub const ALL: [ArchiveKind; 3] = [Self::Export, Self::ExportSources, Self::Package];

    pub fn file_name(self) -> &'static str {
        match self {
            Self::Export => "conan_export.tgz",
            Self::ExportSources => "conan_sources.tgz",
            Self::Package => "conan_package.tgz",
        }
    }

    pub fn from_file_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.file_name() == name)
    }
}

impl std::fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.file_name())
    }
}

fn skip_for(kind: ArchiveKind) -> impl Fn(&str, bool) -> bool {
    move |rel: &str, is_dir: bool| {
        if kind == ArchiveKind::Export && is_dir && rel == EXPORT_SOURCES_DIR {
            return true;
        }
        // The manifest travels next to the archive, not inside it.
        if rel == MANIFEST_FILE {
            return true;
        }
        let name = rel.rsplit('/').next().unwrap_or(rel);
        if is_dir {
            name == "__pycache__"
        } else {
            name.ends_with(".pyc")
                || name.ends_with(".pyo")
                || (!rel.contains('/') && ArchiveKind::from_file_name(rel).is_some())
        }
    }
}

/// Pack `folder` into a gzip tarball.
///
/// For [`ArchiveKind::Export`] the `export_source/` subtree is left out; it
/// travels in its own archive.
pub fn pack(folder: &Path, kind: ArchiveKind) -> Result<Vec<u8>, StoreError> {
    if !folder.is_dir() {
        return Err(StoreError::NotFound(folder.display().to_string()));
    }
    let entries = walk(folder, &skip_for(kind))?;

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut ar = tar::Builder::new(encoder);
    for entry in &entries {
        let meta = fs::metadata(&entry.path)?;
        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(meta.permissions().mode() & 0o7777);
        if entry.is_dir {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_cksum();
            ar.append_data(&mut header, format!("{}/", entry.rel), std::io::empty())?;
        } else {
            let data = fs::read(&entry.path)?;
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(data.len() as u64);
            header.set_cksum();
            ar.append_data(&mut header, &entry.rel, data.as_slice())?;
        }
    }
    let data = ar.into_inner()?.finish()?;
    debug!(
        "packed {} ({} entries, {} bytes) as {kind}",
        folder.display(),
        entries.len(),
        data.len()
    );
    Ok(data)
}

/// A folder extracted into the staging area, not yet visible in the cache.
///
/// Dropping it without committing removes it.
#[derive(Debug)]
pub struct StagedFolder {
    dir: TempDir,
}

impl StagedFolder {
    /// An empty staged folder under `staging_root`, to be filled by the caller.
    pub fn empty(staging_root: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(staging_root)?;
        let dir = tempfile::Builder::new()
            .prefix("stage-")
            .tempdir_in(staging_root)?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn manifest(&self) -> Result<Manifest, StoreError> {
        Manifest::compute(self.path())
    }

    /// Atomically replace `dest` with the staged content.
    ///
    /// An existing `dest` is first renamed aside, then the staged folder is
    /// renamed into place, then the old tree is deleted. If the second rename
    /// fails the old tree is restored.
    pub fn commit(self, dest: &Path) -> Result<(), StoreError> {
        let parent = dest
            .parent()
            .ok_or_else(|| StoreError::Io(std::io::Error::other("destination has no parent")))?;
        fs::create_dir_all(parent)?;
        let staging_root = self
            .dir
            .path()
            .parent()
            .ok_or_else(|| StoreError::Io(std::io::Error::other("staged folder has no parent")))?;

        let backup = if dest.exists() {
            let holder = tempfile::Builder::new()
                .prefix("old-")
                .tempdir_in(staging_root)?;
            fs::rename(dest, holder.path().join("old"))?;
            Some(holder)
        } else {
            None
        };

        if let Err(e) = fs::rename(self.dir.path(), dest) {
            if let Some(holder) = &backup {
                let _ = fs::rename(holder.path().join("old"), dest);
            }
            return Err(e.into());
        }
        fsync_dir(parent)?;
        debug!("committed {}", dest.display());
        // `backup` drops here and deletes the replaced tree.
        Ok(())
    }
}

fn check_entry_path(path: &Path) -> Result<(), StoreError> {
    if path.as_os_str().is_empty() {
        return Err(StoreError::InvalidArchive("empty entry path".to_owned()));
    }
    for c in path.components() {
        match c {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(StoreError::InvalidArchive(format!(
                    "entry '{}' escapes the destination",
                    path.display()
                )))
            }
        }
    }
    Ok(())
}

/// Extract a gzip tarball into a fresh staged folder under `staging_root`.
///
/// Entries with absolute paths, `..` components, or any type other than
/// regular file and directory are rejected and nothing is kept.
pub fn stage(data: &[u8], staging_root: &Path) -> Result<StagedFolder, StoreError> {
    let staged = StagedFolder::empty(staging_root)?;
    let mut ar = tar::Archive::new(GzDecoder::new(data));
    ar.set_preserve_permissions(true);
    ar.set_preserve_mtime(false);
    ar.set_unpack_xattrs(false);

    for entry in ar.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        check_entry_path(&path)?;
        let ty = entry.header().entry_type();
        if !(ty.is_file() || ty.is_dir()) {
            return Err(StoreError::InvalidArchive(format!(
                "entry '{}' has unsupported type {ty:?}",
                path.display()
            )));
        }
        if !entry.unpack_in(staged.path())? {
            return Err(StoreError::InvalidArchive(format!(
                "entry '{}' escapes the destination",
                path.display()
            )));
        }
    }
    Ok(staged)
}
