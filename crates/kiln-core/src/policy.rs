//! Per-package build decisions.
//!
//! [`BuildMode`] is resolved once at the boundary (CLI flag or `kiln.toml`)
//! and [`resolve`] turns it, together with what the local cache and the
//! recipe's provenance remote hold, into one terminal [`Decision`].

use crate::CoreError;
use kiln_remote::SyncEngine;
use kiln_schema::{PackageReference, RecipeHash, RefPattern};
use std::fmt;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildMode {
    /// Reuse or download; never build.
    Never,
    /// Build only when no package can be reused or downloaded.
    Missing,
    /// Like `Missing`, and also rebuild packages made from a superseded recipe.
    Outdated,
    /// Always build recipes matching a pattern; never build the others.
    ForcePatterns(Vec<RefPattern>),
}

impl BuildMode {
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "never" => Some(Self::Never),
            "missing" => Some(Self::Missing),
            "outdated" => Some(Self::Outdated),
            _ => None,
        }
    }

    /// Interpret `--build` values.
    ///
    /// `None` (flag absent) yields `default`. An empty list (flag without a
    /// value) forces every recipe. A single keyword selects that mode; any
    /// other values are recipe name patterns, each matched as a prefix.
    pub fn from_args(values: Option<&[String]>, default: &BuildMode) -> Result<Self, CoreError> {
        let Some(values) = values else {
            return Ok(default.clone());
        };
        if values.is_empty() {
            return Ok(Self::ForcePatterns(vec![RefPattern::any()]));
        }
        if let [single] = values {
            if let Some(mode) = Self::from_keyword(single.trim()) {
                return Ok(mode);
            }
        }

        let mut patterns = Vec::with_capacity(values.len());
        for value in values {
            let value = value.trim();
            if Self::from_keyword(value).is_some() {
                return Err(CoreError::InvalidBuildMode(format!(
                    "'{value}' cannot be combined with other build values"
                )));
            }
            let pattern =
                RefPattern::prefix(value).map_err(|e| CoreError::InvalidBuildMode(e.to_string()))?;
            patterns.push(pattern);
        }
        Ok(Self::ForcePatterns(patterns))
    }

    pub fn forces(&self, package: &PackageReference) -> bool {
        match self {
            Self::ForcePatterns(patterns) => patterns.iter().any(|p| p.matches(&package.recipe)),
            _ => false,
        }
    }

    fn builds_when_missing(&self) -> bool {
        matches!(self, Self::Missing | Self::Outdated)
    }
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => f.write_str("never"),
            Self::Missing => f.write_str("missing"),
            Self::Outdated => f.write_str("outdated"),
            Self::ForcePatterns(patterns) => {
                let joined: Vec<&str> = patterns.iter().map(RefPattern::as_str).collect();
                f.write_str(&joined.join(","))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildReason {
    Forced,
    Missing,
    Outdated,
}

impl fmt::Display for BuildReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forced => f.write_str("forced"),
            Self::Missing => f.write_str("missing"),
            Self::Outdated => f.write_str("outdated"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Reuse,
    Download { remote: String },
    Build { reason: BuildReason },
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reuse => f.write_str("reuse cached package"),
            Self::Download { remote } => write!(f, "download from '{remote}'"),
            Self::Build { reason } => write!(f, "build ({reason})"),
        }
    }
}

/// What the local cache holds for one PackageReference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalPackage {
    Absent,
    /// Manifest matches the folder. `outdated` when built from another recipe
    /// revision than the one cached now.
    Valid { outdated: bool },
    /// Present but its folder no longer matches its manifest.
    Invalid,
}

/// Remote lookups the resolver needs. Only the recipe's provenance remote
/// is ever asked for binaries.
pub trait RemoteProbe {
    /// Name of the provenance remote if it holds `package`.
    fn remote_with_package(&self, package: &PackageReference) -> Result<Option<String>, CoreError>;

    /// Recipe fingerprint recorded in the remote package's info file.
    fn remote_recipe_hash(
        &self,
        package: &PackageReference,
        remote: &str,
    ) -> Result<RecipeHash, CoreError>;
}

impl RemoteProbe for SyncEngine {
    fn remote_with_package(&self, package: &PackageReference) -> Result<Option<String>, CoreError> {
        Ok(self.package_remote(package)?)
    }

    fn remote_recipe_hash(
        &self,
        package: &PackageReference,
        remote: &str,
    ) -> Result<RecipeHash, CoreError> {
        Ok(self.client(remote)?.package_info(package)?.recipe_hash)
    }
}

/// Decide how to materialize `package`.
///
/// `recipe_hash` is the fingerprint of the recipe cached now; it is used to
/// reject remote packages built from a superseded recipe in `Outdated` mode.
pub fn resolve(
    package: &PackageReference,
    mode: &BuildMode,
    local: LocalPackage,
    recipe_hash: &RecipeHash,
    probe: &dyn RemoteProbe,
) -> Result<Decision, CoreError> {
    if mode.forces(package) {
        debug!("{package}: forced by build mode '{mode}'");
        return Ok(Decision::Build {
            reason: BuildReason::Forced,
        });
    }

    match local {
        LocalPackage::Valid { outdated: false } => return Ok(Decision::Reuse),
        LocalPackage::Valid { outdated: true } => {
            if *mode == BuildMode::Outdated {
                return Ok(Decision::Build {
                    reason: BuildReason::Outdated,
                });
            }
            warn!("{package}: cached package was built from an older recipe, reusing it");
            return Ok(Decision::Reuse);
        }
        LocalPackage::Invalid => {
            warn!("{package}: cached package does not match its manifest, ignoring it");
        }
        LocalPackage::Absent => {}
    }

    if let Some(remote) = probe.remote_with_package(package)? {
        if *mode == BuildMode::Outdated
            && probe.remote_recipe_hash(package, &remote)? != *recipe_hash
        {
            debug!("{package}: package on '{remote}' is outdated");
            return Ok(Decision::Build {
                reason: BuildReason::Outdated,
            });
        }
        return Ok(Decision::Download { remote });
    }

    if mode.builds_when_missing() {
        Ok(Decision::Build {
            reason: BuildReason::Missing,
        })
    } else {
        Err(CoreError::MissingBinary {
            package: package.clone(),
            policy: mode.to_string(),
        })
    }
}
