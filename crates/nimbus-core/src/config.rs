//! nimbus.toml configuration parser.
//!
//! Every field has a default, so an empty file (or no file) yields a
//! runnable development configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::label::{LabelPolicy, DEFAULT_RESERVED_LABELS};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NimbusConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub sandbox: SandboxConfig,
    pub deploy: DeployConfig,
    /// Per-site administrative settings keyed by label.
    pub sites: HashMap<String, SiteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    /// Requests for exactly this host go to the administrative API; one
    /// label below it addresses a site.
    pub base_domain: String,
    /// Extra hosts treated as administrative.
    pub admin_aliases: Vec<String>,
    pub reserved_labels: Vec<String>,
    pub max_request_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            base_domain: "localhost".to_string(),
            admin_aliases: Vec::new(),
            reserved_labels: DEFAULT_RESERVED_LABELS.iter().map(|s| s.to_string()).collect(),
            max_request_body_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub max_key_bytes: usize,
    pub max_value_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/nimbus"),
            max_key_bytes: 512,
            max_value_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Wall-clock budget for one execution.
    pub execution_timeout_ms: u64,
    /// Granularity of the epoch ticker that enforces the budget.
    pub epoch_tick_ms: u64,
    pub max_memory_bytes: usize,
    /// Ceiling on the elements of any one guest table.
    pub max_table_elements: usize,
    pub max_concurrent_executions: usize,
    /// How long a request may wait for a free execution slot.
    pub lease_wait_ms: u64,
    /// Extra time past the deadline before the reaper reclaims a lease.
    pub reap_grace_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            execution_timeout_ms: 100,
            epoch_tick_ms: 10,
            max_memory_bytes: 64 * 1024 * 1024,
            max_table_elements: 10_000,
            max_concurrent_executions: 64,
            lease_wait_ms: 1_000,
            reap_grace_ms: 250,
        }
    }
}

impl SandboxConfig {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    pub fn epoch_tick(&self) -> Duration {
        Duration::from_millis(self.epoch_tick_ms)
    }

    pub fn lease_wait(&self) -> Duration {
        Duration::from_millis(self.lease_wait_ms)
    }

    pub fn reap_grace(&self) -> Duration {
        Duration::from_millis(self.reap_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    pub max_archive_bytes: u64,
    pub max_extracted_bytes: u64,
    pub max_files: u64,
    /// Releases kept on disk per site, including the live one.
    pub retain_releases: usize,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            max_archive_bytes: 50 * 1024 * 1024,
            max_extracted_bytes: 200 * 1024 * 1024,
            max_files: 10_000,
            retain_releases: 2,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// Secrets exposed to the site's entry script.
    pub env: HashMap<String, String>,
}

impl NimbusConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: NimbusConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject settings the host cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.base_domain.trim().is_empty() {
            bail!("server.base_domain must not be empty");
        }
        if self.sandbox.execution_timeout_ms == 0 {
            bail!("sandbox.execution_timeout_ms must be positive");
        }
        if self.sandbox.epoch_tick_ms == 0 {
            bail!("sandbox.epoch_tick_ms must be positive");
        }
        if self.sandbox.max_memory_bytes == 0 || self.sandbox.max_table_elements == 0 {
            bail!("sandbox memory and table ceilings must be positive");
        }
        if self.sandbox.max_concurrent_executions == 0 {
            bail!("sandbox.max_concurrent_executions must be positive");
        }
        if self.deploy.retain_releases < 2 {
            bail!("deploy.retain_releases must be at least 2");
        }
        let policy = self.label_policy();
        for label in self.sites.keys() {
            policy
                .check(label)
                .with_context(|| format!("invalid [sites.{label}] section"))?;
        }
        Ok(())
    }

    /// Base domain normalized the way the router compares hosts.
    pub fn base_domain(&self) -> String {
        self.server
            .base_domain
            .trim()
            .trim_end_matches('.')
            .to_ascii_lowercase()
    }

    pub fn label_policy(&self) -> LabelPolicy {
        LabelPolicy::new(self.server.reserved_labels.iter().cloned())
    }
}
