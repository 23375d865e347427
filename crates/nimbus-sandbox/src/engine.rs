//! SandboxEngine: the shared wasmtime engine and linker.
//!
//! The engine is configured for async execution and epoch interruption.
//! A `Linker<HostState>` is built once with the `nimbus.*` host functions;
//! every execution instantiates against it with its own `Store`.

use std::sync::Arc;

use wasmtime::{Config, Engine, Linker};

use crate::bindings;
use crate::host::HostState;

/// Cheap to clone (holds `Arc` references internally).
#[derive(Clone)]
pub struct SandboxEngine {
    engine: Engine,
    linker: Arc<Linker<HostState>>,
}

impl SandboxEngine {
    pub fn new() -> anyhow::Result<Self> {
        let mut config = Config::new();
        config.async_support(true);
        // Deadlines are enforced by bumping the engine epoch from the reaper.
        config.epoch_interruption(true);

        let engine = Engine::new(&config)?;
        let mut linker = Linker::new(&engine);
        bindings::add_to_linker(&mut linker)?;

        tracing::info!("sandbox engine initialized");

        Ok(Self {
            engine,
            linker: Arc::new(linker),
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn linker(&self) -> &Linker<HostState> {
        &self.linker
    }

    /// Advance the epoch by one tick. Running stores yield at their next
    /// epoch check, or trap if their deadline has passed.
    pub fn tick(&self) {
        self.engine.increment_epoch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_creates_successfully() {
        assert!(SandboxEngine::new().is_ok());
    }

    #[test]
    fn linker_exposes_host_imports() {
        let engine = SandboxEngine::new().unwrap();
        let module = wasmtime::Module::new(
            engine.engine(),
            r#"(module
                (import "nimbus" "kv_get" (func (param i32 i32 i32 i32) (result i32)))
                (import "nimbus" "response_send" (func (param i32 i32)))
                (memory (export "memory") 1)
                (func (export "handle")))"#,
        )
        .unwrap();
        // Pre-instantiation succeeds only if every import resolves.
        assert!(engine.linker().instantiate_pre(&module).is_ok());
    }

    #[test]
    fn unknown_imports_fail_to_link() {
        let engine = SandboxEngine::new().unwrap();
        let module = wasmtime::Module::new(
            engine.engine(),
            r#"(module
                (import "wasi_snapshot_preview1" "fd_write"
                    (func (param i32 i32 i32 i32) (result i32)))
                (func (export "handle")))"#,
        )
        .unwrap();
        assert!(engine.linker().instantiate_pre(&module).is_err());
    }
}
