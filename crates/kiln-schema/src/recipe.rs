use crate::reference::RecipeReference;
use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// File name of the declarative recipe, always the first file exported.
pub const RECIPE_FILE: &str = "kilnfile.toml";

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RecipeFile {
    pub name: String,
    pub version: String,
    /// Globs (relative to the recipe directory) copied into `export/`.
    #[serde(default)]
    pub exports: Vec<String>,
    /// Globs copied into `export/export_source/`.
    #[serde(default)]
    pub exports_sources: Vec<String>,
    #[serde(default, rename = "package")]
    pub package_rules: Vec<CopyRule>,
}

/// Copy files matching `pattern` under `src` of the build folder into `dst`
/// of the package folder.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CopyRule {
    pub pattern: String,
    #[serde(default)]
    pub src: String,
    #[serde(default)]
    pub dst: String,
}

impl RecipeFile {
    pub fn reference(&self, user: &str, channel: &str) -> Result<RecipeReference, SchemaError> {
        RecipeReference::new(&self.name, &self.version, user, channel)
    }

    fn validate(&self) -> Result<(), SchemaError> {
        let invalid = |field: &str, reason: String| SchemaError::InvalidRecipe {
            field: field.to_owned(),
            reason,
        };
        RecipeReference::new(&self.name, &self.version, "user", "channel")
            .map_err(|e| invalid("name/version", e.to_string()))?;

        let globs = self
            .exports
            .iter()
            .map(|g| ("exports", g))
            .chain(self.exports_sources.iter().map(|g| ("exports_sources", g)))
            .chain(self.package_rules.iter().map(|r| ("package.pattern", &r.pattern)));
        for (field, g) in globs {
            if g.trim().is_empty() {
                return Err(invalid(field, "empty pattern".to_owned()));
            }
            glob::Pattern::new(g).map_err(|e| invalid(field, format!("'{g}': {}", e.msg)))?;
            if escapes(g) {
                return Err(invalid(field, format!("'{g}' escapes the recipe directory")));
            }
        }
        for rule in &self.package_rules {
            if escapes(&rule.src) || escapes(&rule.dst) {
                return Err(invalid(
                    "package",
                    format!("src/dst of '{}' must stay inside the folder", rule.pattern),
                ));
            }
        }
        Ok(())
    }
}

fn escapes(path: &str) -> bool {
    let p = Path::new(path);
    p.is_absolute()
        || p.components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
}

pub fn parse_recipe_str(input: &str) -> Result<RecipeFile, SchemaError> {
    let recipe: RecipeFile = toml::from_str(input)?;
    recipe.validate()?;
    Ok(recipe)
}

pub fn parse_recipe_file(path: impl AsRef<Path>) -> Result<RecipeFile, SchemaError> {
    let content = fs::read_to_string(path)?;
    parse_recipe_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_recipe() {
        let r = parse_recipe_str(
            r#"
name = "Hello"
version = "0.1"
exports = ["*.h"]
exports_sources = ["src/*"]

[[package]]
pattern = "*.h"
dst = "include"

[[package]]
pattern = "*.a"
src = "lib"
dst = "lib"
"#,
        )
        .unwrap();
        assert_eq!(r.name, "Hello");
        assert_eq!(r.exports, vec!["*.h"]);
        assert_eq!(r.package_rules.len(), 2);
        assert_eq!(r.package_rules[0].src, "");
        assert_eq!(r.package_rules[1].dst, "lib");
        assert_eq!(
            r.reference("lasote", "testing").unwrap().to_string(),
            "Hello/0.1@lasote/testing"
        );
    }

    #[test]
    fn minimal_recipe() {
        let r = parse_recipe_str("name = \"a\"\nversion = \"1\"\n").unwrap();
        assert!(r.exports.is_empty());
        assert!(r.package_rules.is_empty());
    }

    #[test]
    fn rejects_unknown_fields() {
        assert!(parse_recipe_str("name = \"a\"\nversion = \"1\"\nbogus = 1\n").is_err());
    }

    #[test]
    fn rejects_bad_name() {
        let err = parse_recipe_str("name = \"a/b\"\nversion = \"1\"\n").unwrap_err();
        assert!(matches!(err, SchemaError::InvalidRecipe { .. }));
    }

    #[test]
    fn rejects_escaping_globs() {
        assert!(parse_recipe_str("name = \"a\"\nversion = \"1\"\nexports = [\"../x\"]\n").is_err());
        assert!(parse_recipe_str(
            "name = \"a\"\nversion = \"1\"\n[[package]]\npattern = \"*\"\ndst = \"/etc\"\n"
        )
        .is_err());
    }

    #[test]
    fn parse_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(RECIPE_FILE);
        fs::write(&path, "name = \"a\"\nversion = \"1\"\n").unwrap();
        assert_eq!(parse_recipe_file(&path).unwrap().name, "a");
    }
}
