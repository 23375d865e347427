//! Tenant-scoped storage contracts.
//!
//! Both traits take a [`SiteId`] that the caller obtained from the routing
//! decision. Neither offers enumeration or cross-site access.

use std::fmt;

use nimbus_core::SiteId;

use crate::error::StateResult;

/// Durable per-tenant key-value storage.
pub trait KvStore: Send + Sync {
    fn get(&self, site: &SiteId, key: &[u8]) -> StateResult<Option<Vec<u8>>>;

    /// Upsert. Concurrent readers see the whole old or whole new value.
    fn set(&self, site: &SiteId, key: &[u8], value: &[u8]) -> StateResult<()>;

    /// Add `delta` to the decimal integer stored at `key` (absent counts as
    /// zero) in one transaction and return the new value.
    fn increment(&self, site: &SiteId, key: &[u8], delta: i64) -> StateResult<i64>;
}

/// Read-only per-tenant secrets.
pub trait SecretProvider: Send + Sync {
    fn secret(&self, site: &SiteId, name: &str) -> StateResult<Option<SecretValue>>;
}

/// Size limits applied to every KV write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvLimits {
    pub max_key_bytes: usize,
    pub max_value_bytes: usize,
}

impl Default for KvLimits {
    fn default() -> Self {
        Self {
            max_key_bytes: 512,
            max_value_bytes: 1024 * 1024,
        }
    }
}

/// A secret value. Formatting never reveals the contents.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(<redacted>)")
    }
}

impl fmt::Display for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_value_is_redacted() {
        let secret = SecretValue::new("hunter2");
        assert_eq!(format!("{secret:?}"), "SecretValue(<redacted>)");
        assert_eq!(secret.to_string(), "<redacted>");
        assert_eq!(secret.expose(), "hunter2");
    }
}
