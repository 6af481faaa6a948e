//! Filesystem helpers shared by manifests, archives, and the store.

use crate::{fsync_dir, StoreError};
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::warn;

/// One entry found by [`walk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    /// Path relative to the walk root, `/`-separated.
    pub rel: String,
    pub path: PathBuf,
    pub is_dir: bool,
}

/// Recursively list a folder, following symlinks, sorted by relative path.
///
/// `skip(rel, is_dir)` prunes entries (and whole subtrees for directories).
/// Symlink cycles are broken by tracking canonical directory paths; dangling
/// links and special files are skipped with a warning.
pub fn walk(
    root: &Path,
    skip: &dyn Fn(&str, bool) -> bool,
) -> Result<Vec<WalkEntry>, StoreError> {
    let mut out = Vec::new();
    let mut visited = HashSet::new();
    visited.insert(fs::canonicalize(root)?);
    walk_into(root, "", skip, &mut visited, &mut out)?;
    out.sort_by(|a, b| a.rel.cmp(&b.rel));
    Ok(out)
}

fn walk_into(
    dir: &Path,
    prefix: &str,
    skip: &dyn Fn(&str, bool) -> bool,
    visited: &mut HashSet<PathBuf>,
    out: &mut Vec<WalkEntry>,
) -> Result<(), StoreError> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            warn!("skipping non-UTF-8 path {}", path.display());
            continue;
        };
        let rel = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        };

        // fs::metadata follows symlinks.
        let meta = match fs::metadata(&path) {
            Ok(m) => m,
            Err(e) => {
                warn!("skipping {rel}: {e}");
                continue;
            }
        };

        if meta.is_dir() {
            if skip(&rel, true) {
                continue;
            }
            let canonical = fs::canonicalize(&path)?;
            if !visited.insert(canonical) {
                warn!("skipping {rel}: symlink cycle");
                continue;
            }
            out.push(WalkEntry {
                rel: rel.clone(),
                path: path.clone(),
                is_dir: true,
            });
            walk_into(&path, &rel, skip, visited, out)?;
        } else if meta.is_file() {
            if skip(&rel, false) {
                continue;
            }
            out.push(WalkEntry {
                rel,
                path,
                is_dir: false,
            });
        } else {
            warn!("skipping unsupported file type: {rel}");
        }
    }
    Ok(())
}

/// Write `data` to `path` through a temp file in the same directory.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let dir = path
        .parent()
        .ok_or_else(|| StoreError::Io(std::io::Error::other("path has no parent")))?;
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

/// Copy every file under `src` into `dst`, creating directories as needed.
/// Symlinks are copied as the files they point to.
pub fn copy_dir(src: &Path, dst: &Path) -> Result<usize, StoreError> {
    fs::create_dir_all(dst)?;
    let mut copied = 0;
    for entry in walk(src, &|_, _| false)? {
        let target = dst.join(&entry.rel);
        if entry.is_dir {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&entry.path, &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Remove a directory tree. Returns whether anything was there.
pub fn remove_dir_if_exists(path: &Path) -> Result<bool, StoreError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Remove empty parent directories of `path` up to (not including) `stop`.
pub fn prune_empty_parents(path: &Path, stop: &Path) {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == stop || !dir.starts_with(stop) {
            break;
        }
        if fs::remove_dir(dir).is_err() {
            break;
        }
        current = dir.parent();
    }
}
