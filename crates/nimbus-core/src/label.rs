//! Site labels.
//!
//! A site is addressed by a single DNS label under the base domain. The
//! label doubles as the tenant id for every storage namespace, so a
//! [`SiteId`] can only be constructed through validation.

use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static SLUG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9-]{1,63}$").expect("slug pattern compiles"));

/// Labels that always belong to the administrative surface.
pub const DEFAULT_RESERVED_LABELS: &[&str] = &["www", "admin", "api", "app", "dashboard", "mail"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LabelError {
    #[error("invalid site label: {0:?}")]
    Invalid(String),

    #[error("reserved site label: {0}")]
    Reserved(String),
}

/// A validated tenant identifier (`^[a-z0-9-]{1,63}$`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SiteId(String);

impl SiteId {
    /// Validate the slug shape of `label`.
    ///
    /// This does not consult the reserved list; use [`LabelPolicy::check`]
    /// for labels arriving from outside.
    pub fn parse(label: &str) -> Result<Self, LabelError> {
        if SLUG.is_match(label) {
            Ok(Self(label.to_string()))
        } else {
            Err(LabelError::Invalid(label.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SiteId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SiteId {
    type Error = LabelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SiteId> for String {
    fn from(id: SiteId) -> Self {
        id.0
    }
}

/// Slug validation plus the reserved administrative labels.
#[derive(Debug, Clone)]
pub struct LabelPolicy {
    reserved: HashSet<String>,
}

impl LabelPolicy {
    pub fn new<I, S>(reserved: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            reserved: reserved.into_iter().map(Into::into).collect(),
        }
    }

    /// Validate a label supplied by a request or a deploy call.
    pub fn check(&self, label: &str) -> Result<SiteId, LabelError> {
        let id = SiteId::parse(label)?;
        if self.reserved.contains(id.as_str()) {
            return Err(LabelError::Reserved(label.to_string()));
        }
        Ok(id)
    }

    pub fn is_reserved(&self, label: &str) -> bool {
        self.reserved.contains(label)
    }
}

impl Default for LabelPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RESERVED_LABELS.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_slugs() {
        for label in ["a", "blog", "my-site-2", "0", &"x".repeat(63)] {
            assert!(SiteId::parse(label).is_ok(), "{label} should be valid");
        }
    }

    #[test]
    fn rejects_non_slugs() {
        for label in ["", "Blog", "my_site", "a.b", "../etc", "é", &"x".repeat(64)] {
            assert_eq!(
                SiteId::parse(label),
                Err(LabelError::Invalid(label.to_string())),
                "{label:?} should be rejected"
            );
        }
    }

    #[test]
    fn policy_rejects_reserved() {
        let policy = LabelPolicy::default();
        assert_eq!(
            policy.check("admin"),
            Err(LabelError::Reserved("admin".to_string()))
        );
        assert!(policy.check("blog").is_ok());
        assert!(policy.is_reserved("www"));
    }

    #[test]
    fn deserialize_revalidates() {
        let ok: SiteId = serde_json::from_str("\"blog\"").unwrap();
        assert_eq!(ok.as_str(), "blog");
        assert!(serde_json::from_str::<SiteId>("\"../x\"").is_err());
    }
}
