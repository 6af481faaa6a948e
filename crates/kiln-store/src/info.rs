use crate::fsutil::write_atomic;
use crate::StoreError;
use kiln_schema::{BinaryConfig, PackageId, RecipeHash};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

/// Configuration summary file written into every package folder.
pub const INFO_FILE: &str = "conaninfo.txt";

/// Contents of `conaninfo.txt`: the configuration a package was built for
/// and the fingerprint of the recipe it was built from.
///
/// ```text
/// [settings]
///     os=Linux
/// [options]
///     shared=True
/// [env]
///
/// [recipe_hash]
///     5f1c...
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageInfo {
    pub config: BinaryConfig,
    pub recipe_hash: RecipeHash,
}

impl PackageInfo {
    pub fn new(config: BinaryConfig, recipe_hash: RecipeHash) -> Self {
        Self {
            config,
            recipe_hash,
        }
    }

    pub fn package_id(&self) -> PackageId {
        self.config.package_id()
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for (name, map) in [
            ("settings", &self.config.settings),
            ("options", &self.config.options),
            ("env", &self.config.env),
        ] {
            let _ = writeln!(out, "[{name}]");
            for (k, v) in map {
                let _ = writeln!(out, "    {k}={v}");
            }
            out.push('\n');
        }
        let _ = writeln!(out, "[recipe_hash]");
        let _ = writeln!(out, "    {}", self.recipe_hash);
        out
    }

    pub fn parse(text: &str) -> Result<Self, StoreError> {
        let mut config = BinaryConfig::default();
        let mut recipe_hash = None;
        let mut section: Option<String> = None;

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                section = Some(name.to_owned());
                continue;
            }
            let target: &mut BTreeMap<String, String> = match section.as_deref() {
                Some("settings") => &mut config.settings,
                Some("options") => &mut config.options,
                Some("env") => &mut config.env,
                Some("recipe_hash") => {
                    recipe_hash = Some(RecipeHash::new(line));
                    continue;
                }
                // Unknown sections are tolerated for forward compatibility.
                Some(_) => continue,
                None => {
                    return Err(StoreError::InvalidInfo(format!(
                        "line {}: entry outside of a section",
                        idx + 1
                    )))
                }
            };
            let (k, v) = line.split_once('=').ok_or_else(|| {
                StoreError::InvalidInfo(format!("line {}: expected 'key=value'", idx + 1))
            })?;
            target.insert(k.trim().to_owned(), v.trim().to_owned());
        }

        let recipe_hash =
            recipe_hash.ok_or_else(|| StoreError::InvalidInfo("missing [recipe_hash]".to_owned()))?;
        Ok(Self {
            config,
            recipe_hash,
        })
    }

    pub fn load(folder: &Path) -> Result<Self, StoreError> {
        let path = folder.join(INFO_FILE);
        match fs::read_to_string(&path) {
            Ok(text) => Self::parse(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, folder: &Path) -> Result<(), StoreError> {
        write_atomic(&folder.join(INFO_FILE), self.serialize().as_bytes())
    }
}
