//! Script execution.
//!
//! [`WasmExecutor`] runs one entry script per request: fetch the compiled
//! module, lease a slot, build a fresh `Store` bound to the routed site,
//! instantiate, call `handle`, and collect the response. Nothing a script
//! touches outlives its `Store` except the KV writes it made.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};
use wasmtime::{Module, Store, Trap, UpdateDeadline};

use nimbus_core::config::SandboxConfig;
use nimbus_core::{Outcome, SiteId};
use nimbus_state::{KvStore, SecretProvider};

use crate::cache::ScriptCache;
use crate::engine::SandboxEngine;
use crate::error::{SandboxError, SandboxResult};
use crate::host::HostState;
use crate::limiter::{ResourceCeilings, ResourceUsage, TenantLimiter};
use crate::pool::LeasePool;
use crate::request::{RequestSnapshot, SandboxResponse};
use crate::state::{ExecutionState, Phase};

/// Exported entry point every script must provide.
pub const HANDLE_EXPORT: &str = "handle";
/// Exported linear memory every script must provide.
pub const MEMORY_EXPORT: &str = "memory";

/// The script to run and the site it runs for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptTarget {
    pub site: SiteId,
    pub entry_script: PathBuf,
}

/// Result of one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed(SandboxResponse),
    TimedOut,
    Errored,
    Busy,
}

impl ExecutionOutcome {
    /// The response shown to the visitor. Failures never carry detail.
    pub fn into_response(self) -> SandboxResponse {
        match self {
            ExecutionOutcome::Completed(response) => response,
            ExecutionOutcome::TimedOut => SandboxResponse::plain(500, "execution timeout"),
            ExecutionOutcome::Errored => SandboxResponse::plain(500, "internal error"),
            ExecutionOutcome::Busy => SandboxResponse::plain(503, "sandbox busy"),
        }
    }

    pub fn activity_outcome(&self) -> Outcome {
        match self {
            ExecutionOutcome::Completed(_) => Outcome::Function,
            ExecutionOutcome::TimedOut => Outcome::Timeout,
            ExecutionOutcome::Errored => Outcome::Error,
            ExecutionOutcome::Busy => Outcome::Busy,
        }
    }
}

/// Runs entry scripts.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, target: &ScriptTarget, request: RequestSnapshot) -> ExecutionOutcome;
}

/// Limits applied to every execution.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub timeout: Duration,
    /// Interval at which the reaper advances the engine epoch. A running
    /// script yields to the runtime once per tick.
    pub epoch_tick: Duration,
    pub ceilings: ResourceCeilings,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from(&SandboxConfig::default())
    }
}

impl From<&SandboxConfig> for ExecutorConfig {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            timeout: config.execution_timeout(),
            epoch_tick: config.epoch_tick(),
            ceilings: ResourceCeilings::from(config),
        }
    }
}

/// Called on every epoch tick a store sees: trap once `deadline` has
/// passed, otherwise hand the worker back to the runtime before resuming.
fn on_epoch(deadline: Instant, now: Instant) -> UpdateDeadline {
    if now >= deadline {
        UpdateDeadline::Interrupt
    } else {
        UpdateDeadline::YieldCustom(1, Box::pin(tokio::task::yield_now()))
    }
}

/// Executor backed by the shared wasmtime engine.
pub struct WasmExecutor {
    engine: SandboxEngine,
    cache: Arc<ScriptCache>,
    pool: LeasePool,
    kv: Arc<dyn KvStore>,
    secrets: Arc<dyn SecretProvider>,
    config: ExecutorConfig,
}

impl WasmExecutor {
    pub fn new(
        engine: SandboxEngine,
        pool: LeasePool,
        kv: Arc<dyn KvStore>,
        secrets: Arc<dyn SecretProvider>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            engine,
            cache: Arc::new(ScriptCache::default()),
            pool,
            kv,
            secrets,
            config,
        }
    }

    pub fn pool(&self) -> &LeasePool {
        &self.pool
    }

    pub fn engine(&self) -> &SandboxEngine {
        &self.engine
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    async fn load(&self, target: &ScriptTarget) -> SandboxResult<Module> {
        let cache = self.cache.clone();
        let engine = self.engine.engine().clone();
        let path = target.entry_script.clone();
        tokio::task::spawn_blocking(move || cache.load(&engine, &path))
            .await
            .map_err(|e| SandboxError::Engine(anyhow::anyhow!("compile task failed: {e}")))?
    }

    async fn run(
        &self,
        target: &ScriptTarget,
        module: &Module,
        request: RequestSnapshot,
        deadline: Instant,
        state: &mut ExecutionState,
    ) -> SandboxResult<(SandboxResponse, ResourceUsage)> {
        let host = HostState::new(
            target.site.clone(),
            request,
            self.kv.clone(),
            self.secrets.clone(),
            TenantLimiter::new(target.site.clone(), self.config.ceilings),
        );
        let mut store = Store::new(self.engine.engine(), host);
        store.limiter(|host| &mut host.limiter);
        store.set_epoch_deadline(1);
        store.epoch_deadline_callback(move |_| Ok(on_epoch(deadline, Instant::now())));

        let instance = self
            .engine
            .linker()
            .instantiate_async(&mut store, module)
            .await?;
        if instance.get_memory(&mut store, MEMORY_EXPORT).is_none() {
            return Err(SandboxError::MissingExport(MEMORY_EXPORT));
        }
        let handle = instance
            .get_typed_func::<(), ()>(&mut store, HANDLE_EXPORT)
            .map_err(|_| SandboxError::MissingExport(HANDLE_EXPORT))?;

        state.advance(Phase::Running)?;
        handle.call_async(&mut store, ()).await?;

        let host = store.into_data();
        Ok((host.response.finish(), host.limiter.usage()))
    }
}

fn is_interrupt(err: &SandboxError) -> bool {
    match err {
        SandboxError::Engine(err) => matches!(err.downcast_ref::<Trap>(), Some(Trap::Interrupt)),
        _ => false,
    }
}

#[async_trait]
impl Executor for WasmExecutor {
    async fn execute(&self, target: &ScriptTarget, request: RequestSnapshot) -> ExecutionOutcome {
        let site = &target.site;
        // Compilation happens before the slot is leased and the clock starts.
        let module = match self.load(target).await {
            Ok(module) => module,
            Err(e) => {
                error!(%site, error = %e, "entry script failed to load");
                return ExecutionOutcome::Errored;
            }
        };

        let lease = match self.pool.lease(site, self.config.timeout).await {
            Ok(lease) => lease,
            Err(SandboxError::Busy) => {
                warn!(%site, "no execution slot available");
                return ExecutionOutcome::Busy;
            }
            Err(e) => {
                error!(%site, error = %e, "failed to lease execution slot");
                return ExecutionOutcome::Errored;
            }
        };

        let started = Instant::now();
        let mut state = ExecutionState::new();
        let result = self
            .run(target, &module, request, lease.deadline(), &mut state)
            .await;
        let elapsed = started.elapsed();
        let late = elapsed > self.config.timeout || lease.was_reclaimed();

        let mut usage = ResourceUsage::default();
        let (phase, outcome) = match result {
            Ok(_) if late => {
                warn!(%site, elapsed_ms = elapsed.as_millis() as u64, "script finished past its deadline");
                (Phase::TimedOut, ExecutionOutcome::TimedOut)
            }
            Ok((response, used)) => {
                usage = used;
                (Phase::Completed, ExecutionOutcome::Completed(response))
            }
            Err(e) if is_interrupt(&e) || late => {
                warn!(%site, elapsed_ms = elapsed.as_millis() as u64, "script timed out");
                (Phase::TimedOut, ExecutionOutcome::TimedOut)
            }
            Err(e) => {
                error!(%site, phase = ?state.phase(), error = %e, "script failed");
                (Phase::Errored, ExecutionOutcome::Errored)
            }
        };

        if let Err(e) = state.advance(phase).and_then(|()| state.advance(Phase::Finalized)) {
            error!(%site, error = %e, "execution state machine violated");
        }
        drop(lease);

        match &outcome {
            ExecutionOutcome::Completed(response) => info!(
                %site,
                status = response.status,
                elapsed_ms = elapsed.as_millis() as u64,
                peak_memory_bytes = usage.peak_memory_bytes,
                denied_growths = usage.denied_growths,
                "script completed"
            ),
            other => debug!(%site, outcome = other.activity_outcome().as_str(), "execution finished"),
        }
        outcome
    }
}
