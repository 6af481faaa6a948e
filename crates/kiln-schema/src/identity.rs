use crate::types::PackageId;
use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Number of hex characters kept from the blake3 digest.
pub const PACKAGE_ID_LEN: usize = 40;

/// Configuration that affects one binary variant.
///
/// Keys and values are opaque strings; kiln never interprets them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryConfig {
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl BinaryConfig {
    pub fn is_empty(&self) -> bool {
        self.settings.is_empty() && self.options.is_empty() && self.env.is_empty()
    }

    /// All pairs, keys prefixed by their section so that an option and a
    /// setting with the same name never collide.
    pub fn pairs(&self) -> Vec<(String, String)> {
        let section = |prefix: &'static str, map: &BTreeMap<String, String>| {
            map.iter()
                .map(move |(k, v)| (format!("{prefix}.{k}"), v.clone()))
                .collect::<Vec<_>>()
        };
        let mut out = section("settings", &self.settings);
        out.extend(section("options", &self.options));
        out.extend(section("env", &self.env));
        out
    }

    pub fn package_id(&self) -> PackageId {
        compute_package_id(self.pairs())
    }
}

/// Trim, sort by key then value, and drop duplicate pairs.
pub fn canonicalize<I, K, V>(pairs: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut out: Vec<(String, String)> = pairs
        .into_iter()
        .map(|(k, v)| (k.as_ref().trim().to_owned(), v.as_ref().trim().to_owned()))
        .collect();
    out.sort();
    out.dedup();
    out
}

/// Deterministic PackageID for an unordered set of `(key, value)` pairs.
///
/// The empty set hashes to a fixed constant like any other input.
pub fn compute_package_id<I, K, V>(pairs: I) -> PackageId
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut hasher = blake3::Hasher::new();
    for (k, v) in canonicalize(pairs) {
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
        hasher.update(b"\n");
    }
    let hex = hasher.finalize().to_hex();
    PackageId::new(&hex.as_str()[..PACKAGE_ID_LEN])
}

/// Parse a `name=value` command-line assignment.
pub fn parse_assignment(input: &str) -> Result<(String, String), SchemaError> {
    let (k, v) = input
        .split_once('=')
        .ok_or_else(|| SchemaError::InvalidAssignment(input.to_owned()))?;
    let k = k.trim();
    if k.is_empty() {
        return Err(SchemaError::InvalidAssignment(input.to_owned()));
    }
    Ok((k.to_owned(), v.trim().to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_does_not_matter() {
        let a = compute_package_id([("os", "Linux"), ("arch", "x86_64")]);
        let b = compute_package_id([("arch", "x86_64"), ("os", "Linux")]);
        assert_eq!(a, b);
    }

    #[test]
    fn whitespace_and_duplicates_are_ignored() {
        let a = compute_package_id([("os", "Linux"), ("arch", "x86_64")]);
        let b = compute_package_id([(" os ", "Linux "), ("arch", "x86_64"), ("os", "Linux")]);
        assert_eq!(a, b);
    }

    #[test]
    fn different_values_give_different_ids() {
        let a = compute_package_id([("os", "Linux")]);
        let b = compute_package_id([("os", "Windows")]);
        assert_ne!(a, b);
    }

    #[test]
    fn empty_config_is_stable_and_well_formed() {
        let a = compute_package_id(Vec::<(String, String)>::new());
        let b = BinaryConfig::default().package_id();
        assert_eq!(a, b);
        assert_eq!(a.len(), PACKAGE_ID_LEN);
        assert!(a.is_well_formed());
    }

    #[test]
    fn sections_are_namespaced() {
        let mut as_setting = BinaryConfig::default();
        as_setting.settings.insert("shared".into(), "True".into());
        let mut as_option = BinaryConfig::default();
        as_option.options.insert("shared".into(), "True".into());
        assert_ne!(as_setting.package_id(), as_option.package_id());
    }

    #[test]
    fn pairs_carry_prefixes() {
        let mut cfg = BinaryConfig::default();
        cfg.settings.insert("os".into(), "Linux".into());
        cfg.env.insert("CC".into(), "clang".into());
        let pairs = cfg.pairs();
        assert!(pairs.contains(&("settings.os".into(), "Linux".into())));
        assert!(pairs.contains(&("env.CC".into(), "clang".into())));
    }

    #[test]
    fn assignment_parsing() {
        assert_eq!(
            parse_assignment("os=Linux").unwrap(),
            ("os".to_owned(), "Linux".to_owned())
        );
        assert_eq!(
            parse_assignment("flags=-O2=x").unwrap(),
            ("flags".to_owned(), "-O2=x".to_owned())
        );
        assert!(parse_assignment("os").is_err());
        assert!(parse_assignment("=Linux").is_err());
    }
}
