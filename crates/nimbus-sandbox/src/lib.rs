//! nimbus-sandbox: execution sandbox for tenant entry scripts.
//!
//! - **engine**: shared wasmtime engine (async, epoch interruption) and linker
//! - **bindings**: the `nimbus.*` host imports (request view, response
//!   builder, scoped KV, secrets, log)
//! - **host**: per-execution host state with site-scoped storage handles
//! - **request**: request snapshot and response builder
//! - **limiter**: per-site memory and table ceilings with usage accounting
//! - **cache**: compiled entry-script cache
//! - **pool**: bounded execution leases and the epoch/reaper thread
//! - **state**: execution lifecycle state machine
//! - **executor**: the `Executor` trait and `WasmExecutor`

pub mod bindings;
pub mod cache;
pub mod engine;
pub mod error;
pub mod executor;
pub mod host;
pub mod limiter;
pub mod pool;
pub mod request;
pub mod state;

pub use engine::SandboxEngine;
pub use error::{SandboxError, SandboxResult};
pub use executor::{ExecutionOutcome, Executor, ExecutorConfig, ScriptTarget, WasmExecutor};
pub use limiter::{ResourceCeilings, ResourceUsage};
pub use pool::{LeasePool, PoolConfig, Reaper};
pub use request::{RequestSnapshot, SandboxResponse};
