use crate::types::PackageId;
use crate::SchemaError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Immutable identity of a recipe: `name/version@user/channel`.
///
/// Equality is exact and case-sensitive on all four fields.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecipeReference {
    pub name: String,
    pub version: String,
    pub user: String,
    pub channel: String,
}

/// One binary variant of a recipe.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PackageReference {
    pub recipe: RecipeReference,
    pub package_id: PackageId,
}

// Fields become directory names and are embedded in patterns, so separators
// and glob metacharacters are rejected.
fn validate_field(input: &str, field: &str, value: &str) -> Result<(), SchemaError> {
    let invalid = |reason: String| SchemaError::InvalidReference {
        input: input.to_owned(),
        reason,
    };
    if value.is_empty() {
        return Err(invalid(format!("{field} must not be empty")));
    }
    if value == "." || value == ".." {
        return Err(invalid(format!("{field} must not be '{value}'")));
    }
    if let Some(c) = value
        .chars()
        .find(|c| matches!(c, '/' | '\\' | '@' | ':' | '*' | '?' | '[' | ']') || c.is_whitespace() || c.is_control())
    {
        return Err(invalid(format!("{field} contains invalid character {c:?}")));
    }
    Ok(())
}

impl RecipeReference {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        user: impl Into<String>,
        channel: impl Into<String>,
    ) -> Result<Self, SchemaError> {
        let r = Self {
            name: name.into(),
            version: version.into(),
            user: user.into(),
            channel: channel.into(),
        };
        let text = r.to_string();
        validate_field(&text, "name", &r.name)?;
        validate_field(&text, "version", &r.version)?;
        validate_field(&text, "user", &r.user)?;
        validate_field(&text, "channel", &r.channel)?;
        Ok(r)
    }

    /// Relative cache path: `name/version/user/channel`.
    pub fn rel_path(&self) -> PathBuf {
        [&self.name, &self.version, &self.user, &self.channel]
            .iter()
            .collect()
    }

    /// Same name and version under another `user/channel`.
    pub fn with_user_channel(&self, user: &str, channel: &str) -> Result<Self, SchemaError> {
        Self::new(&self.name, &self.version, user, channel)
    }

    pub fn package(&self, package_id: PackageId) -> PackageReference {
        PackageReference {
            recipe: self.clone(),
            package_id,
        }
    }
}

impl fmt::Display for RecipeReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{}/{}",
            self.name, self.version, self.user, self.channel
        )
    }
}

impl FromStr for RecipeReference {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = |reason: &str| SchemaError::InvalidReference {
            input: s.to_owned(),
            reason: reason.to_owned(),
        };
        let (left, right) = s
            .split_once('@')
            .ok_or_else(|| invalid("expected 'name/version@user/channel'"))?;
        let (name, version) = left
            .split_once('/')
            .ok_or_else(|| invalid("missing '/' between name and version"))?;
        let (user, channel) = right
            .split_once('/')
            .ok_or_else(|| invalid("missing '/' between user and channel"))?;
        Self::new(name, version, user, channel)
    }
}

impl Serialize for RecipeReference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RecipeReference {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl PackageReference {
    pub fn new(recipe: RecipeReference, package_id: PackageId) -> Result<Self, SchemaError> {
        if !package_id.is_well_formed() {
            return Err(SchemaError::InvalidPackageReference(format!(
                "{recipe}:{package_id}"
            )));
        }
        Ok(Self { recipe, package_id })
    }
}

impl fmt::Display for PackageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.recipe, self.package_id)
    }
}

impl FromStr for PackageReference {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (recipe, id) = s
            .rsplit_once(':')
            .ok_or_else(|| SchemaError::InvalidPackageReference(s.to_owned()))?;
        Self::new(recipe.parse()?, PackageId::new(id))
    }
}

impl Serialize for PackageReference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PackageReference {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
