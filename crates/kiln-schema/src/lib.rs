//! References, identity, patterns, and recipe files for kiln.
//!
//! This crate defines the schema layer: recipe references
//! (`name/version@user/channel`), package references, deterministic
//! PackageID computation from a binary configuration (`compute_package_id`),
//! the glob-style reference matcher shared by local and remote lookups
//! (`RefPattern`), and the declarative `kilnfile.toml` recipe format.

pub mod identity;
pub mod pattern;
pub mod recipe;
pub mod reference;
pub mod types;

pub use identity::{canonicalize, compute_package_id, parse_assignment, BinaryConfig};
pub use pattern::RefPattern;
pub use recipe::{parse_recipe_file, parse_recipe_str, CopyRule, RecipeFile, RECIPE_FILE};
pub use reference::{PackageReference, RecipeReference};
pub use types::{Checksum, PackageId, RecipeHash};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("invalid reference '{input}': {reason}")]
    InvalidReference { input: String, reason: String },
    #[error("invalid package reference '{0}', expected '<name>/<version>@<user>/<channel>:<package_id>'")]
    InvalidPackageReference(String),
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("invalid input '{0}', use 'name=value'")]
    InvalidAssignment(String),
    #[error("failed to read recipe file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse recipe file: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("recipe field '{field}' is invalid: {reason}")]
    InvalidRecipe { field: String, reason: String },
}
