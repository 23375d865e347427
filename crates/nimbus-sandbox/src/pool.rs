//! Execution lease pool and reaper.
//!
//! The pool is the one piece of mutable state shared by all executions: a
//! bounded set of slots, each leased for one request and returned when the
//! lease is dropped. A lease records the execution deadline.
//!
//! The [`Reaper`] runs on a dedicated OS thread rather than a tokio task,
//! so the epoch keeps advancing however busy the runtime workers are.
//! Every tick it advances the engine epoch, which makes each running store
//! yield its worker (or trap once past its deadline), and reclaims any
//! lease still held `grace` after its deadline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use nimbus_core::SiteId;
use nimbus_core::config::SandboxConfig;

use crate::engine::SandboxEngine;
use crate::error::{SandboxError, SandboxResult};

/// Pool sizing and timing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub capacity: usize,
    /// How long `lease` waits for a free slot.
    pub wait: Duration,
    /// Time past a deadline before the reaper reclaims the slot.
    pub grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            wait: Duration::from_secs(1),
            grace: Duration::from_millis(250),
        }
    }
}

impl From<&SandboxConfig> for PoolConfig {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            capacity: config.max_concurrent_executions,
            wait: config.lease_wait(),
            grace: config.reap_grace(),
        }
    }
}

struct LeaseEntry {
    site: SiteId,
    deadline: Instant,
    reclaimed: Arc<AtomicBool>,
    /// Dropping the entry returns the slot.
    _permit: OwnedSemaphorePermit,
}

struct PoolInner {
    config: PoolConfig,
    slots: Arc<Semaphore>,
    leases: Mutex<HashMap<u64, LeaseEntry>>,
    next_id: AtomicU64,
}

impl PoolInner {
    fn leases(&self) -> MutexGuard<'_, HashMap<u64, LeaseEntry>> {
        self.leases.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Bounded pool of execution slots. Cheap to clone.
#[derive(Clone)]
pub struct LeasePool {
    inner: Arc<PoolInner>,
}

impl LeasePool {
    pub fn new(config: PoolConfig) -> Self {
        let capacity = config.capacity.max(1);
        info!(capacity, "execution lease pool created");
        Self {
            inner: Arc::new(PoolInner {
                slots: Arc::new(Semaphore::new(capacity)),
                config: PoolConfig { capacity, ..config },
                leases: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Lease a slot for an execution that must finish within `budget`.
    ///
    /// Waits up to the configured `wait` for a slot, then fails with
    /// [`SandboxError::Busy`]. The deadline starts once the slot is held.
    pub async fn lease(&self, site: &SiteId, budget: Duration) -> SandboxResult<Lease> {
        let permit = tokio::time::timeout(
            self.inner.config.wait,
            self.inner.slots.clone().acquire_owned(),
        )
        .await
        .map_err(|_| SandboxError::Busy)?
        .map_err(|_| SandboxError::Busy)?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + budget;
        let reclaimed = Arc::new(AtomicBool::new(false));
        self.inner.leases().insert(
            id,
            LeaseEntry {
                site: site.clone(),
                deadline,
                reclaimed: reclaimed.clone(),
                _permit: permit,
            },
        );
        debug!(lease = id, %site, "execution slot leased");

        Ok(Lease {
            id,
            deadline,
            reclaimed,
            pool: self.inner.clone(),
        })
    }

    /// Reclaim every lease whose deadline plus grace is before `now`.
    /// Returns the number reclaimed.
    pub fn reap_expired(&self, now: Instant) -> usize {
        let grace = self.inner.config.grace;
        let mut leases = self.inner.leases();
        let expired: Vec<u64> = leases
            .iter()
            .filter(|(_, entry)| entry.deadline + grace <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            if let Some(entry) = leases.remove(id) {
                entry.reclaimed.store(true, Ordering::SeqCst);
                warn!(lease = id, site = %entry.site, "reclaimed expired execution lease");
            }
        }
        expired.len()
    }

    /// Leases currently held.
    pub fn active(&self) -> usize {
        self.inner.leases().len()
    }

    /// Slots free right now.
    pub fn available(&self) -> usize {
        self.inner.slots.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.inner.config.capacity
    }
}

/// One leased execution slot. Returned to the pool on drop.
pub struct Lease {
    id: u64,
    deadline: Instant,
    reclaimed: Arc<AtomicBool>,
    pool: Arc<PoolInner>,
}

impl Lease {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// True once the reaper has taken the slot back.
    pub fn was_reclaimed(&self) -> bool {
        self.reclaimed.load(Ordering::SeqCst)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.pool.leases().remove(&self.id).is_some() {
            debug!(lease = self.id, "execution slot returned");
        }
    }
}

/// Background epoch ticker and lease reaper.
pub struct Reaper {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Reaper {
    pub fn spawn(engine: SandboxEngine, pool: LeasePool, tick: Duration) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name("nimbus-reaper".to_string())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    thread::sleep(tick);
                    engine.tick();
                    pool.reap_expired(Instant::now());
                }
                debug!("reaper stopped");
            })?;
        info!(tick_ms = tick.as_millis() as u64, "reaper started");
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.shutdown();
    }
}
