//! Per-execution resource ceilings.
//!
//! Every `Store` carries a [`TenantLimiter`] bound to the site it runs for.
//! Growth past the site's [`ResourceCeilings`] is refused, which the guest
//! sees as a failed `memory.grow` (returns -1) rather than a host error.
//! Refusals are logged against the site and counted in [`ResourceUsage`].

use tracing::warn;
use wasmtime::ResourceLimiter;

use nimbus_core::SiteId;
use nimbus_core::config::SandboxConfig;

/// Growth ceilings shared by every execution on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceCeilings {
    pub memory_bytes: usize,
    pub table_elements: usize,
}

impl Default for ResourceCeilings {
    fn default() -> Self {
        Self::from(&SandboxConfig::default())
    }
}

impl From<&SandboxConfig> for ResourceCeilings {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            memory_bytes: config.max_memory_bytes,
            table_elements: config.max_table_elements,
        }
    }
}

/// What one execution grew to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    pub peak_memory_bytes: usize,
    pub peak_table_elements: usize,
    pub denied_growths: u32,
}

#[derive(Debug, Clone, Copy)]
enum Resource {
    Memory,
    Table,
}

impl Resource {
    fn as_str(self) -> &'static str {
        match self {
            Resource::Memory => "memory",
            Resource::Table => "table",
        }
    }
}

/// Limiter installed on one execution's `Store`.
pub struct TenantLimiter {
    site: SiteId,
    ceilings: ResourceCeilings,
    usage: ResourceUsage,
}

impl TenantLimiter {
    pub fn new(site: SiteId, ceilings: ResourceCeilings) -> Self {
        Self {
            site,
            ceilings,
            usage: ResourceUsage::default(),
        }
    }

    pub fn site(&self) -> &SiteId {
        &self.site
    }

    pub fn ceilings(&self) -> ResourceCeilings {
        self.ceilings
    }

    pub fn usage(&self) -> ResourceUsage {
        self.usage
    }

    fn admit(&mut self, resource: Resource, current: usize, desired: usize) -> bool {
        let (limit, peak) = match resource {
            Resource::Memory => (self.ceilings.memory_bytes, &mut self.usage.peak_memory_bytes),
            Resource::Table => (self.ceilings.table_elements, &mut self.usage.peak_table_elements),
        };
        if desired <= limit {
            *peak = (*peak).max(desired);
            return true;
        }
        self.usage.denied_growths = self.usage.denied_growths.saturating_add(1);
        warn!(
            site = %self.site,
            resource = resource.as_str(),
            current,
            desired,
            limit,
            "tenant growth denied"
        );
        false
    }
}

impl ResourceLimiter for TenantLimiter {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        Ok(self.admit(Resource::Memory, current, desired))
    }

    fn table_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        Ok(self.admit(Resource::Table, current, desired))
    }
}
