//! Assembly of a Nimbus host from its configuration.
//!
//! [`Host::build`] wires every subsystem together:
//! - state store (redb) under `data_dir`, seeded with `[sites.*.env]`
//! - site registry and deploy pipeline over the on-disk release layout
//! - wasm engine, lease pool, reaper thread and executor
//! - the host router, with the admin API mounted on the base domain

use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use nimbus_core::{ActivitySink, NimbusConfig};
use nimbus_deploy::{DataLayout, DeployLimits, Deployer, DeploymentLedger, SiteRegistry};
use nimbus_router::{AdminState, AppState, RouterConfig, build_router};
use nimbus_sandbox::{ExecutorConfig, LeasePool, PoolConfig, Reaper, SandboxEngine, WasmExecutor};
use nimbus_state::{KvLimits, StateStore};

/// A fully assembled host.
pub struct Host {
    router: Router,
    store: StateStore,
    executor: Arc<WasmExecutor>,
    reaper: Reaper,
}

impl Host {
    pub fn build(config: &NimbusConfig, activity: Arc<dyn ActivitySink>) -> anyhow::Result<Self> {
        config.validate()?;

        let layout = DataLayout::new(&config.storage.data_dir);
        layout
            .prepare()
            .with_context(|| format!("failed to prepare {}", layout.root().display()))?;

        let db_path = layout.db_path();
        let store = StateStore::open(&db_path)?.with_limits(KvLimits {
            max_key_bytes: config.storage.max_key_bytes,
            max_value_bytes: config.storage.max_value_bytes,
        });
        info!(path = %db_path.display(), "state store opened");

        let policy = config.label_policy();
        for (label, site) in &config.sites {
            let id = policy.check(label)?;
            store.seed_secrets(&id, &site.env)?;
            info!(site = %id, secrets = site.env.len(), "seeded site secrets");
        }

        let ledger: Arc<dyn DeploymentLedger> = Arc::new(store.clone());
        let registry = SiteRegistry::new(layout.clone(), ledger.clone(), policy.clone());
        let deployer = Deployer::new(layout, ledger, policy, DeployLimits::from(&config.deploy));

        let engine = SandboxEngine::new()?;
        let pool = LeasePool::new(PoolConfig::from(&config.sandbox));
        let reaper = Reaper::spawn(engine.clone(), pool.clone(), config.sandbox.epoch_tick())
            .context("failed to start reaper thread")?;
        let tenant_data = Arc::new(store.clone());
        let executor = Arc::new(WasmExecutor::new(
            engine,
            pool,
            tenant_data.clone(),
            tenant_data,
            ExecutorConfig::from(&config.sandbox),
        ));
        info!(
            timeout_ms = config.sandbox.execution_timeout_ms,
            slots = config.sandbox.max_concurrent_executions,
            "sandbox initialized"
        );

        let router_config = RouterConfig::from(config);
        let admin = AdminState {
            registry,
            deployer: Arc::new(deployer),
            store: store.clone(),
            max_archive_bytes: router_config.max_archive_bytes,
        };
        let state = AppState::new(&router_config, admin, executor.clone(), activity);

        Ok(Self {
            router: build_router(state),
            store,
            executor,
            reaper,
        })
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn executor(&self) -> &WasmExecutor {
        &self.executor
    }

    /// Serve until `shutdown` resolves, then stop the reaper.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await?;
        self.reaper.stop();
        Ok(())
    }

    pub fn stop(self) {
        self.reaper.stop();
    }
}
