//! Compiled entry-script cache.
//!
//! Modules are expensive to compile but cheap to instantiate, so each entry
//! script is compiled once and reused. Only the compiled code is shared:
//! every execution still gets a fresh `Store` and `Instance`.
//!
//! Entries are keyed by path and modification time. A redeploy lands in a
//! new release directory, so the new script is a new key.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use tracing::{debug, info};
use wasmtime::{Engine, Module};

use crate::error::{SandboxError, SandboxResult};

pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    path: PathBuf,
    modified: Option<SystemTime>,
}

struct Inner {
    modules: HashMap<CacheKey, Module>,
    /// Insertion order for eviction.
    order: VecDeque<CacheKey>,
}

pub struct ScriptCache {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl ScriptCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                modules: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    /// Return the compiled module for `path`, compiling it on a miss.
    ///
    /// Accepts both the binary and the text format.
    pub fn load(&self, engine: &Engine, path: &Path) -> SandboxResult<Module> {
        let modified = std::fs::metadata(path)
            .map_err(|e| SandboxError::Load {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?
            .modified()
            .ok();
        let key = CacheKey {
            path: path.to_path_buf(),
            modified,
        };

        if let Some(module) = self.lock().modules.get(&key) {
            debug!(path = %path.display(), "entry script cache hit");
            return Ok(module.clone());
        }

        // Compile outside the lock; a racing compile of the same key is harmless.
        let module = Module::from_file(engine, path).map_err(|e| SandboxError::Load {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        info!(path = %path.display(), "compiled entry script");

        let mut inner = self.lock();
        if !inner.modules.contains_key(&key) {
            inner.order.push_back(key.clone());
        }
        inner.modules.insert(key, module.clone());
        while inner.modules.len() > self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.modules.remove(&oldest);
                }
                None => break,
            }
        }
        Ok(module)
    }

    pub fn len(&self) -> usize {
        self.lock().modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned cache only ever holds fully-built entries.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ScriptCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
