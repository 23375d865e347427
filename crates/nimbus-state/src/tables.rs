//! redb table definitions for the Nimbus state store.

use redb::TableDefinition;

/// Site records keyed by label.
pub const SITES: TableDefinition<&str, &[u8]> = TableDefinition::new("sites");

/// Deployment records keyed by `{site}:{seq:020}`.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Tenant key-value entries keyed by `(site, key)`.
///
/// Values carry an 8-byte little-endian `updated_at` (unix millis) header
/// followed by the raw value.
pub const KV: TableDefinition<(&str, &[u8]), &[u8]> = TableDefinition::new("kv");

/// Tenant secrets keyed by `(site, name)`.
pub const SECRETS: TableDefinition<(&str, &str), &str> = TableDefinition::new("secrets");
