//! StateStore: redb-backed state persistence for Nimbus.
//!
//! Provides the site registry, the deployment log, and the tenant KV and
//! secret namespaces. Supports both on-disk and in-memory backends (the
//! latter for testing).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use nimbus_core::{now_millis, DeploymentRecord, Site, SiteId};

use crate::error::{StateError, StateResult};
use crate::kv::{KvLimits, KvStore, SecretProvider, SecretValue};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

const KV_HEADER_LEN: usize = 8;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    limits: KvLimits,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            limits: KvLimits::default(),
        };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            limits: KvLimits::default(),
        };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Replace the KV size limits.
    pub fn with_limits(self, limits: KvLimits) -> Self {
        Self { limits, ..self }
    }

    pub fn limits(&self) -> KvLimits {
        self.limits
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(SITES).map_err(map_err!(Table))?;
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(KV).map_err(map_err!(Table))?;
        txn.open_table(SECRETS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Sites ──────────────────────────────────────────────────────

    /// Get a site by label.
    pub fn get_site(&self, id: &SiteId) -> StateResult<Option<Site>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SITES).map_err(map_err!(Table))?;
        match table.get(id.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let site: Site =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(site))
            }
            None => Ok(None),
        }
    }

    /// List all sites.
    pub fn list_sites(&self) -> StateResult<Vec<Site>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SITES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let site: Site = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(site);
        }
        Ok(results)
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Store the site row and its new deployment record in one transaction.
    ///
    /// Deployment records are append-only: writing a key that already
    /// exists is rejected and nothing is committed.
    pub fn record_deployment(&self, site: &Site, record: &DeploymentRecord) -> StateResult<()> {
        let site_value = serde_json::to_vec(site).map_err(map_err!(Serialize))?;
        let record_value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let record_key = record.table_key();

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut deployments = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            if deployments
                .get(record_key.as_str())
                .map_err(map_err!(Read))?
                .is_some()
            {
                return Err(StateError::Write(format!(
                    "deployment {record_key} already recorded"
                )));
            }
            deployments
                .insert(record_key.as_str(), record_value.as_slice())
                .map_err(map_err!(Write))?;

            let mut sites = txn.open_table(SITES).map_err(map_err!(Table))?;
            sites
                .insert(site.id.as_str(), site_value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(site = %site.id, seq = record.id, "deployment recorded");
        Ok(())
    }

    /// Sequence number of the most recent deployment for a site.
    pub fn latest_deployment_seq(&self, id: &SiteId) -> StateResult<Option<u64>> {
        let (start, end) = deployment_range(id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        let mut range = table
            .range::<&str>(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?;
        match range.next_back() {
            Some(entry) => {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let record: DeploymentRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record.id))
            }
            None => Ok(None),
        }
    }

    /// List a site's deployments, oldest first.
    pub fn list_deployments(&self, id: &SiteId) -> StateResult<Vec<DeploymentRecord>> {
        let (start, end) = deployment_range(id);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table
            .range::<&str>(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: DeploymentRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    // ── Secrets (administrative) ───────────────────────────────────

    /// Insert or replace a secret.
    pub fn put_secret(&self, id: &SiteId, name: &str, value: &str) -> StateResult<()> {
        if name.is_empty() || name.len() > self.limits.max_key_bytes {
            return Err(StateError::Limit("secret name length".to_string()));
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(SECRETS).map_err(map_err!(Table))?;
            table
                .insert((id.as_str(), name), value)
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(site = %id, %name, "secret stored");
        Ok(())
    }

    /// Delete a secret. Returns true if it existed.
    pub fn delete_secret(&self, id: &SiteId, name: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(SECRETS).map_err(map_err!(Table))?;
            existed = table
                .remove((id.as_str(), name))
                .map_err(map_err!(Write))?
                .is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(site = %id, %name, existed, "secret deleted");
        Ok(existed)
    }

    /// Secret names for a site. Values are never listed.
    pub fn list_secret_names(&self, id: &SiteId) -> StateResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SECRETS).map_err(map_err!(Table))?;
        let mut names = Vec::new();
        for entry in table
            .range::<(&str, &str)>((id.as_str(), "")..)
            .map_err(map_err!(Read))?
        {
            let (key, _) = entry.map_err(map_err!(Read))?;
            let (site, name) = key.value();
            if site != id.as_str() {
                break;
            }
            names.push(name.to_string());
        }
        Ok(names)
    }

    /// Load administratively configured secrets for a site.
    pub fn seed_secrets(&self, id: &SiteId, env: &HashMap<String, String>) -> StateResult<()> {
        for (name, value) in env {
            self.put_secret(id, name, value)?;
        }
        Ok(())
    }

    fn check_kv_limits(&self, key: &[u8], value: Option<&[u8]>) -> StateResult<()> {
        if key.is_empty() || key.len() > self.limits.max_key_bytes {
            return Err(StateError::Limit(format!(
                "key length {} outside 1..={}",
                key.len(),
                self.limits.max_key_bytes
            )));
        }
        match value {
            Some(value) if value.len() > self.limits.max_value_bytes => {
                Err(StateError::Limit(format!(
                    "value length {} exceeds {}",
                    value.len(),
                    self.limits.max_value_bytes
                )))
            }
            _ => Ok(()),
        }
    }
}

impl KvStore for StateStore {
    fn get(&self, site: &SiteId, key: &[u8]) -> StateResult<Option<Vec<u8>>> {
        self.check_kv_limits(key, None)?;
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(KV).map_err(map_err!(Table))?;
        match table.get((site.as_str(), key)).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode_kv(guard.value())?.to_vec())),
            None => Ok(None),
        }
    }

    fn set(&self, site: &SiteId, key: &[u8], value: &[u8]) -> StateResult<()> {
        self.check_kv_limits(key, Some(value))?;
        let encoded = encode_kv(now_millis(), value);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(KV).map_err(map_err!(Table))?;
            table
                .insert((site.as_str(), key), encoded.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn increment(&self, site: &SiteId, key: &[u8], delta: i64) -> StateResult<i64> {
        self.check_kv_limits(key, None)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let next;
        {
            let mut table = txn.open_table(KV).map_err(map_err!(Table))?;
            let current = match table.get((site.as_str(), key)).map_err(map_err!(Read))? {
                Some(guard) => parse_counter(decode_kv(guard.value())?)?,
                None => 0,
            };
            next = current
                .checked_add(delta)
                .ok_or_else(|| StateError::Invalid("counter overflow".to_string()))?;
            let encoded = encode_kv(now_millis(), next.to_string().as_bytes());
            table
                .insert((site.as_str(), key), encoded.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(next)
    }
}

impl SecretProvider for StateStore {
    fn secret(&self, site: &SiteId, name: &str) -> StateResult<Option<SecretValue>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SECRETS).map_err(map_err!(Table))?;
        Ok(table
            .get((site.as_str(), name))
            .map_err(map_err!(Read))?
            .map(|guard| SecretValue::new(guard.value())))
    }
}

fn deployment_range(id: &SiteId) -> (String, String) {
    // ';' sorts immediately after ':'.
    (format!("{id}:"), format!("{id};"))
}

fn encode_kv(updated_at: u64, value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(KV_HEADER_LEN + value.len());
    buf.extend_from_slice(&updated_at.to_le_bytes());
    buf.extend_from_slice(value);
    buf
}

fn decode_kv(raw: &[u8]) -> StateResult<&[u8]> {
    raw.get(KV_HEADER_LEN..)
        .ok_or_else(|| StateError::Deserialize("truncated kv entry".to_string()))
}

fn parse_counter(raw: &[u8]) -> StateResult<i64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .ok_or_else(|| StateError::Invalid("stored value is not an integer".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::thread;

    use nimbus_core::Actor;

    fn site(label: &str) -> SiteId {
        SiteId::parse(label).unwrap()
    }

    fn test_site(label: &str, release: u64) -> Site {
        Site {
            id: site(label),
            storage_root: PathBuf::from(format!("/data/sites/{label}")),
            current_release: release,
            created_at: 1000,
            last_deployed_at: 1000 + release,
        }
    }

    fn test_record(label: &str, seq: u64) -> DeploymentRecord {
        DeploymentRecord {
            id: seq,
            site_id: site(label),
            size_bytes: 128,
            file_count: 2,
            deployed_by: Actor::new("alice").unwrap(),
            sha256: "ab".repeat(32),
            created_at: 1000 + seq,
        }
    }

    #[test]
    fn site_get_nonexistent_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_site(&site("nope")).unwrap().is_none());
    }

    #[test]
    fn record_deployment_stores_site_and_record() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .record_deployment(&test_site("blog", 1), &test_record("blog", 1))
            .unwrap();

        let stored = store.get_site(&site("blog")).unwrap().unwrap();
        assert_eq!(stored.current_release, 1);
        assert_eq!(store.list_deployments(&site("blog")).unwrap().len(), 1);
        assert_eq!(store.latest_deployment_seq(&site("blog")).unwrap(), Some(1));
    }

    #[test]
    fn deployment_records_are_append_only() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .record_deployment(&test_site("blog", 1), &test_record("blog", 1))
            .unwrap();
        let err = store
            .record_deployment(&test_site("blog", 1), &test_record("blog", 1))
            .unwrap_err();
        assert!(matches!(err, StateError::Write(_)));
    }

    #[test]
    fn deployments_listed_in_order_and_scoped() {
        let store = StateStore::open_in_memory().unwrap();
        for seq in [1, 2, 10] {
            store
                .record_deployment(&test_site("blog", seq), &test_record("blog", seq))
                .unwrap();
        }
        store
            .record_deployment(&test_site("blog-2", 1), &test_record("blog-2", 1))
            .unwrap();

        let ids: Vec<u64> = store
            .list_deployments(&site("blog"))
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![1, 2, 10]);
        assert_eq!(store.latest_deployment_seq(&site("blog")).unwrap(), Some(10));
        assert_eq!(store.latest_deployment_seq(&site("other")).unwrap(), None);
        assert_eq!(store.list_sites().unwrap().len(), 2);
    }

    #[test]
    fn kv_set_then_get() {
        let store = StateStore::open_in_memory().unwrap();
        let a = site("a");
        assert_eq!(store.get(&a, b"counter").unwrap(), None);
        store.set(&a, b"counter", b"1").unwrap();
        assert_eq!(store.get(&a, b"counter").unwrap(), Some(b"1".to_vec()));
        store.set(&a, b"counter", b"2").unwrap();
        assert_eq!(store.get(&a, b"counter").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn kv_is_isolated_per_site() {
        let store = StateStore::open_in_memory().unwrap();
        store.set(&site("a"), b"shared", b"from-a").unwrap();
        store.set(&site("b"), b"shared", b"from-b").unwrap();

        assert_eq!(store.get(&site("a"), b"shared").unwrap(), Some(b"from-a".to_vec()));
        assert_eq!(store.get(&site("b"), b"shared").unwrap(), Some(b"from-b".to_vec()));
        // Keys that look like another tenant's namespace are just keys.
        assert_eq!(store.get(&site("a"), b"b/shared").unwrap(), None);
        assert_eq!(store.get(&site("a"), b"b:shared").unwrap(), None);
    }

    #[test]
    fn kv_enforces_limits() {
        let store = StateStore::open_in_memory().unwrap().with_limits(KvLimits {
            max_key_bytes: 4,
            max_value_bytes: 8,
        });
        let a = site("a");
        assert!(matches!(store.set(&a, b"", b"v"), Err(StateError::Limit(_))));
        assert!(matches!(store.set(&a, b"toolong", b"v"), Err(StateError::Limit(_))));
        assert!(matches!(store.set(&a, b"k", &[0u8; 9]), Err(StateError::Limit(_))));
        assert!(store.set(&a, b"k", &[0u8; 8]).is_ok());
    }

    #[test]
    fn kv_concurrent_reads_never_see_partial_values() {
        let store = StateStore::open_in_memory().unwrap();
        let a = site("a");
        let old = vec![b'o'; 64 * 1024];
        let new = vec![b'n'; 64 * 1024];
        store.set(&a, b"blob", &old).unwrap();

        let writer = {
            let store = store.clone();
            let a = a.clone();
            let (old, new) = (old.clone(), new.clone());
            thread::spawn(move || {
                for i in 0..50 {
                    let v = if i % 2 == 0 { &new } else { &old };
                    store.set(&a, b"blob", v).unwrap();
                }
            })
        };
        for _ in 0..200 {
            let seen = store.get(&a, b"blob").unwrap().unwrap();
            assert!(seen == old || seen == new, "observed a torn value");
        }
        writer.join().unwrap();
    }

    #[test]
    fn increment_is_atomic_under_concurrency() {
        let store = StateStore::open_in_memory().unwrap();
        let a = site("a");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let a = a.clone();
                thread::spawn(move || {
                    for _ in 0..25 {
                        store.increment(&a, b"hits", 1).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.get(&a, b"hits").unwrap(), Some(b"200".to_vec()));
    }

    #[test]
    fn increment_rejects_non_numeric() {
        let store = StateStore::open_in_memory().unwrap();
        let a = site("a");
        store.set(&a, b"name", b"bob").unwrap();
        assert!(matches!(store.increment(&a, b"name", 1), Err(StateError::Invalid(_))));
    }

    #[test]
    fn secrets_are_scoped_and_listed_by_name() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_secret(&site("a"), "TOKEN", "t-a").unwrap();
        store.put_secret(&site("a"), "DB_URL", "postgres://").unwrap();
        store.put_secret(&site("ab"), "TOKEN", "t-ab").unwrap();

        assert_eq!(store.secret(&site("a"), "TOKEN").unwrap().unwrap().expose(), "t-a");
        assert!(store.secret(&site("b"), "TOKEN").unwrap().is_none());
        assert_eq!(store.list_secret_names(&site("a")).unwrap(), vec!["DB_URL", "TOKEN"]);

        assert!(store.delete_secret(&site("a"), "TOKEN").unwrap());
        assert!(!store.delete_secret(&site("a"), "TOKEN").unwrap());
        assert!(store.secret(&site("a"), "TOKEN").unwrap().is_none());
    }

    #[test]
    fn persistent_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nimbus.redb");
        {
            let store = StateStore::open(&path).unwrap();
            store.set(&site("a"), b"k", b"v").unwrap();
        }
        let store = StateStore::open(&path).unwrap();
        assert_eq!(store.get(&site("a"), b"k").unwrap(), Some(b"v".to_vec()));
    }
}
