//! Glob-style matcher over canonical reference text.
//!
//! One compiled [`RefPattern`] is shared by local listing, remote search,
//! removal, upload selection, and forced-build policies. `*` and `?` cross
//! the `/` and `@` separators, so `Hello*` matches every version and channel
//! of `Hello`.

use crate::reference::RecipeReference;
use crate::SchemaError;
use glob::{MatchOptions, Pattern};
use std::fmt;

#[derive(Debug, Clone)]
pub struct RefPattern {
    source: String,
    compiled: Pattern,
    case_sensitive: bool,
}

const META: &[char] = &['*', '?', '['];

impl RefPattern {
    pub fn new(pattern: &str) -> Result<Self, SchemaError> {
        let source = pattern.trim();
        if source.is_empty() {
            return Err(SchemaError::InvalidPattern {
                pattern: pattern.to_owned(),
                reason: "pattern must not be empty".to_owned(),
            });
        }
        let compiled = Pattern::new(source).map_err(|e| SchemaError::InvalidPattern {
            pattern: pattern.to_owned(),
            reason: e.msg.to_owned(),
        })?;
        Ok(Self {
            source: source.to_owned(),
            compiled,
            case_sensitive: true,
        })
    }

    /// Pattern that matches everything.
    pub fn any() -> Self {
        Self {
            source: "*".to_owned(),
            compiled: Pattern::new("*").unwrap_or_default(),
            case_sensitive: true,
        }
    }

    /// `pattern*`, unless it already ends in `*`.
    pub fn prefix(pattern: &str) -> Result<Self, SchemaError> {
        let trimmed = pattern.trim();
        if trimmed.ends_with('*') {
            Self::new(trimmed)
        } else {
            Self::new(&format!("{trimmed}*"))
        }
    }

    /// The same pattern, matched without regard to ASCII case.
    #[must_use]
    pub fn case_insensitive(mut self) -> Self {
        self.case_sensitive = false;
        self
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, reference: &RecipeReference) -> bool {
        self.matches_str(&reference.to_string())
    }

    pub fn matches_str(&self, text: &str) -> bool {
        let options = MatchOptions {
            case_sensitive: self.case_sensitive,
            require_literal_separator: false,
            require_literal_leading_dot: false,
        };
        self.compiled.matches_with(text, options)
    }

    /// The exact reference this pattern names, if it contains no wildcards.
    pub fn as_reference(&self) -> Option<RecipeReference> {
        if self.source.contains(META) {
            return None;
        }
        self.source.parse().ok()
    }
}

impl fmt::Display for RefPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl PartialEq for RefPattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.case_sensitive == other.case_sensitive
    }
}

impl Eq for RefPattern {}

impl std::str::FromStr for RefPattern {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(s: &str) -> RecipeReference {
        s.parse().unwrap()
    }

    #[test]
    fn star_crosses_separators() {
        let p = RefPattern::new("Hello*").unwrap();
        assert!(p.matches(&r("Hello/0.1@lasote/testing")));
        assert!(p.matches(&r("HelloWorld/2.0@x/stable")));
        assert!(!p.matches(&r("Bye/0.1@lasote/testing")));
    }

    #[test]
    fn exact_pattern_is_a_reference() {
        let p = RefPattern::new("Hello/0.1@lasote/testing").unwrap();
        assert_eq!(p.as_reference(), Some(r("Hello/0.1@lasote/testing")));
        assert!(p.matches(&r("Hello/0.1@lasote/testing")));
        assert!(!p.matches(&r("Hello/0.1@lasote/stable")));
        assert!(RefPattern::new("Hello/*").unwrap().as_reference().is_none());
    }

    #[test]
    fn case_insensitive_matching() {
        let p = RefPattern::new("hello*").unwrap();
        assert!(!p.matches(&r("Hello/0.1@lasote/testing")));
        let p = p.case_insensitive();
        assert!(p.matches(&r("Hello/0.1@lasote/testing")));
    }

    #[test]
    fn prefix_appends_star_once() {
        assert_eq!(RefPattern::prefix("Hello").unwrap().as_str(), "Hello*");
        assert_eq!(RefPattern::prefix("Hello*").unwrap().as_str(), "Hello*");
    }

    #[test]
    fn any_matches_all() {
        assert!(RefPattern::any().matches(&r("a/b@c/d")));
    }

    #[test]
    fn invalid_patterns_are_rejected() {
        assert!(RefPattern::new("").is_err());
        assert!(RefPattern::new("[unclosed").is_err());
    }

    #[test]
    fn channel_wildcard() {
        let p = RefPattern::new("*@lasote/stable").unwrap();
        assert!(p.matches(&r("Hello/0.1@lasote/stable")));
        assert!(!p.matches(&r("Hello/0.1@lasote/testing")));
    }
}
