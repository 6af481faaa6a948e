use crate::StoreError;
use kiln_schema::{PackageReference, RecipeReference};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Current cache format version. Incremented on incompatible layout changes.
pub const CACHE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

/// Per-recipe folders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipeFolder {
    Export,
    ExportSources,
    Source,
}

/// Per-package folders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageFolder {
    Build,
    Package,
}

/// Directory layout of a kiln cache.
///
/// Every path under the cache root is computed here, as a pure function of
/// the reference. Directories are created lazily; [`initialize`](Self::initialize)
/// only creates the top-level skeleton.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheVersion {
    format_version: u32,
}

impl CacheLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    #[inline]
    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    /// Temporary extraction area. Lives on the same filesystem as `data/`
    /// so staged folders can be renamed into place.
    #[inline]
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    #[inline]
    pub fn config_file(&self) -> PathBuf {
        self.root.join("kiln.toml")
    }

    #[inline]
    pub fn registry_file(&self) -> PathBuf {
        self.root.join("registry.json")
    }

    #[inline]
    pub fn registry_lock_file(&self) -> PathBuf {
        self.locks_dir().join("registry.lock")
    }

    #[inline]
    pub fn recipe_dir(&self, reference: &RecipeReference) -> PathBuf {
        self.data_dir().join(reference.rel_path())
    }

    #[inline]
    pub fn metadata_file(&self, reference: &RecipeReference) -> PathBuf {
        self.recipe_dir(reference).join("metadata.json")
    }

    pub fn recipe_path(&self, reference: &RecipeReference, folder: RecipeFolder) -> PathBuf {
        let dir = self.recipe_dir(reference);
        match folder {
            RecipeFolder::Export => dir.join("export"),
            RecipeFolder::ExportSources => dir.join("export").join(crate::EXPORT_SOURCES_DIR),
            RecipeFolder::Source => dir.join("source"),
        }
    }

    #[inline]
    pub fn builds_dir(&self, reference: &RecipeReference) -> PathBuf {
        self.recipe_dir(reference).join("build")
    }

    #[inline]
    pub fn packages_dir(&self, reference: &RecipeReference) -> PathBuf {
        self.recipe_dir(reference).join("package")
    }

    pub fn package_path(&self, package: &PackageReference, folder: PackageFolder) -> PathBuf {
        let parent = match folder {
            PackageFolder::Build => self.builds_dir(&package.recipe),
            PackageFolder::Package => self.packages_dir(&package.recipe),
        };
        parent.join(package.package_id.as_str())
    }

    /// Advisory lock file for one reference. Named by hash so that lock files
    /// stay flat and never collide with recipe directories.
    pub fn lock_file(&self, reference: &RecipeReference) -> PathBuf {
        let hash = blake3::hash(reference.to_string().as_bytes()).to_hex();
        self.locks_dir()
            .join(format!("{}.lock", &hash.as_str()[..32]))
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.data_dir())?;
        fs::create_dir_all(self.locks_dir())?;
        fs::create_dir_all(self.staging_dir())?;

        let version_path = self.root.join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let ver = CacheVersion {
                format_version: CACHE_FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&ver)?;
            let mut tmp = NamedTempFile::new_in(&self.root)?;
            tmp.write_all(content.as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&version_path)
                .map_err(|e| StoreError::Io(e.error))?;
            crate::fsync_dir(&self.root)?;
        }

        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let content = fs::read_to_string(self.root.join(VERSION_FILE))?;
        let ver: CacheVersion = serde_json::from_str(&content)?;

        if ver.format_version != CACHE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: CACHE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_schema::PackageId;

    fn hello() -> RecipeReference {
        "Hello/0.1@lasote/testing".parse().unwrap()
    }

    #[test]
    fn recipe_paths_are_correct() {
        let layout = CacheLayout::new("/tmp/kiln-test");
        let r = hello();
        assert_eq!(
            layout.recipe_path(&r, RecipeFolder::Export),
            PathBuf::from("/tmp/kiln-test/data/Hello/0.1/lasote/testing/export")
        );
        assert_eq!(
            layout.recipe_path(&r, RecipeFolder::ExportSources),
            PathBuf::from("/tmp/kiln-test/data/Hello/0.1/lasote/testing/export/export_source")
        );
        assert_eq!(
            layout.recipe_path(&r, RecipeFolder::Source),
            PathBuf::from("/tmp/kiln-test/data/Hello/0.1/lasote/testing/source")
        );
        assert_eq!(
            layout.metadata_file(&r),
            PathBuf::from("/tmp/kiln-test/data/Hello/0.1/lasote/testing/metadata.json")
        );
    }

    #[test]
    fn package_paths_are_correct() {
        let layout = CacheLayout::new("/tmp/kiln-test");
        let p = hello().package(PackageId::new("abc123"));
        assert_eq!(
            layout.package_path(&p, PackageFolder::Package),
            PathBuf::from("/tmp/kiln-test/data/Hello/0.1/lasote/testing/package/abc123")
        );
        assert_eq!(
            layout.package_path(&p, PackageFolder::Build),
            PathBuf::from("/tmp/kiln-test/data/Hello/0.1/lasote/testing/build/abc123")
        );
    }

    #[test]
    fn lock_files_are_distinct_per_reference() {
        let layout = CacheLayout::new("/tmp/kiln-test");
        let a = layout.lock_file(&hello());
        let b = layout.lock_file(&"Hello/0.1@lasote/stable".parse().unwrap());
        assert_ne!(a, b);
        assert_eq!(a.parent().unwrap(), layout.locks_dir());
    }

    #[test]
    fn initialize_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let layout = CacheLayout::new(dir.path());
        layout.initialize().unwrap();

        assert!(layout.data_dir().is_dir());
        assert!(layout.locks_dir().is_dir());
        assert!(layout.staging_dir().is_dir());
    }

    #[test]
    fn initialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = CacheLayout::new(dir.path());
        layout.initialize().unwrap();
        layout.initialize().unwrap();
        layout.verify_version().unwrap();
    }

    #[test]
    fn incompatible_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("version"), r#"{"format_version": 99}"#).unwrap();
        let layout = CacheLayout::new(dir.path());
        assert!(matches!(
            layout.initialize(),
            Err(StoreError::VersionMismatch { found: 99, .. })
        ));
    }
}
