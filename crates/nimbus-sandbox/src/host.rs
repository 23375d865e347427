//! Per-execution host state.
//!
//! One `HostState` lives inside each `Store` and is dropped with it. The
//! storage handles are bound to the routed [`SiteId`] at construction, so a
//! script only ever supplies keys, never a tenant.

use std::sync::Arc;

use nimbus_core::SiteId;
use nimbus_state::{KvStore, SecretProvider, SecretValue, StateResult};

use crate::limiter::TenantLimiter;
use crate::request::{RequestSnapshot, ResponseBuilder};

/// Key-value handle fixed to one site.
#[derive(Clone)]
pub struct ScopedKv {
    site: SiteId,
    store: Arc<dyn KvStore>,
}

impl ScopedKv {
    pub fn new(site: SiteId, store: Arc<dyn KvStore>) -> Self {
        Self { site, store }
    }

    pub fn get(&self, key: &[u8]) -> StateResult<Option<Vec<u8>>> {
        self.store.get(&self.site, key)
    }

    pub fn set(&self, key: &[u8], value: &[u8]) -> StateResult<()> {
        self.store.set(&self.site, key, value)
    }

    pub fn increment(&self, key: &[u8], delta: i64) -> StateResult<i64> {
        self.store.increment(&self.site, key, delta)
    }
}

/// Read-only secret view fixed to one site.
#[derive(Clone)]
pub struct ScopedEnv {
    site: SiteId,
    provider: Arc<dyn SecretProvider>,
}

impl ScopedEnv {
    pub fn new(site: SiteId, provider: Arc<dyn SecretProvider>) -> Self {
        Self { site, provider }
    }

    pub fn get(&self, name: &str) -> StateResult<Option<SecretValue>> {
        self.provider.secret(&self.site, name)
    }
}

/// Everything a running script can reach.
pub struct HostState {
    pub site: SiteId,
    pub request: RequestSnapshot,
    pub response: ResponseBuilder,
    pub kv: ScopedKv,
    pub env: ScopedEnv,
    pub limiter: TenantLimiter,
}

impl HostState {
    pub fn new(
        site: SiteId,
        request: RequestSnapshot,
        kv: Arc<dyn KvStore>,
        secrets: Arc<dyn SecretProvider>,
        limiter: TenantLimiter,
    ) -> Self {
        Self {
            kv: ScopedKv::new(site.clone(), kv),
            env: ScopedEnv::new(site.clone(), secrets),
            site,
            request,
            response: ResponseBuilder::new(),
            limiter,
        }
    }
}
