//! Records shared across Nimbus crates.
//!
//! These are persisted as JSON in the state store and returned verbatim by
//! the administrative API.

use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::label::SiteId;

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A hosted site. Created by its first successful deploy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    pub id: SiteId,
    /// Directory holding the `current` pointer and the site's releases.
    pub storage_root: PathBuf,
    /// Sequence number of the live release.
    pub current_release: u64,
    /// Unix timestamp (milliseconds).
    pub created_at: u64,
    /// Unix timestamp (milliseconds).
    pub last_deployed_at: u64,
}

/// One successful deploy. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    /// Per-site sequence number; also names the release directory.
    pub id: u64,
    pub site_id: SiteId,
    /// Size of the uploaded archive.
    pub size_bytes: u64,
    pub file_count: u64,
    pub deployed_by: Actor,
    /// Hex SHA-256 of the uploaded archive.
    pub sha256: String,
    /// Unix timestamp (milliseconds).
    pub created_at: u64,
}

impl DeploymentRecord {
    /// Composite key for the deployments table. Zero-padded so a
    /// lexicographic scan returns records in deploy order.
    pub fn table_key(&self) -> String {
        deployment_key(&self.site_id, self.id)
    }
}

pub fn deployment_key(site_id: &SiteId, seq: u64) -> String {
    format!("{site_id}:{seq:020}")
}

/// Identity handed to us by the external auth boundary. Trusted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Actor(String);

impl Actor {
    /// Returns `None` for blank identities.
    pub fn new(name: impl Into<String>) -> Option<Self> {
        let name = name.into();
        let trimmed = name.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
