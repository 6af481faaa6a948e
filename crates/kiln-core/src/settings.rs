use crate::policy::BuildMode;
use crate::CoreError;
use kiln_remote::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Contents of `kiln.toml` at the cache root. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub upload: UploadSettings,
    #[serde(default)]
    pub general: GeneralSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UploadSettings {
    /// Extra attempts after the first failure.
    #[serde(default = "default_retry")]
    pub retry: u32,
    /// Seconds between attempts.
    #[serde(default = "default_retry_wait")]
    pub retry_wait: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneralSettings {
    #[serde(default = "default_build")]
    pub default_build: String,
}

fn default_retry() -> u32 {
    2
}

fn default_retry_wait() -> u64 {
    5
}

fn default_build() -> String {
    "never".to_owned()
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            retry: default_retry(),
            retry_wait: default_retry_wait(),
        }
    }
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            default_build: default_build(),
        }
    }
}

impl Settings {
    /// Read `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        let invalid = |reason: String| CoreError::Settings {
            path: path.display().to_string(),
            reason,
        };
        let settings: Self = toml::from_str(&content).map_err(|e| invalid(e.to_string()))?;
        settings
            .default_build_mode()
            .map_err(|e| invalid(e.to_string()))?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        let content = toml::to_string_pretty(self).map_err(|e| CoreError::Settings {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        kiln_store::fsutil::write_atomic(path, content.as_bytes())?;
        Ok(())
    }

    /// Mode used when no build mode is requested explicitly.
    pub fn default_build_mode(&self) -> Result<BuildMode, CoreError> {
        BuildMode::from_keyword(&self.general.default_build).ok_or_else(|| {
            CoreError::InvalidBuildMode(format!(
                "default_build must be never, missing, or outdated, not '{}'",
                self.general.default_build
            ))
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.upload.retry,
            Duration::from_secs(self.upload.retry_wait),
        )
    }
}

/// Cache root: explicit flag, else `KILN_HOME`, else `~/.kiln`.
pub fn resolve_cache_root(flag: Option<&Path>) -> Result<PathBuf, CoreError> {
    cache_root_from(
        flag,
        std::env::var_os("KILN_HOME"),
        std::env::var_os("HOME"),
    )
}

fn cache_root_from(
    flag: Option<&Path>,
    kiln_home: Option<OsString>,
    home: Option<OsString>,
) -> Result<PathBuf, CoreError> {
    if let Some(path) = flag {
        return Ok(path.to_path_buf());
    }
    if let Some(dir) = kiln_home.filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    home.filter(|v| !v.is_empty())
        .map(|h| PathBuf::from(h).join(".kiln"))
        .ok_or_else(|| {
            CoreError::InvalidRequest(
                "cannot locate the cache: pass --cache or set KILN_HOME or HOME".to_owned(),
            )
        })
}
