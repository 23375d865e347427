//! Site registry: label to live release.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use nimbus_core::{DeploymentRecord, LabelPolicy, Site};

use crate::error::RegistryResult;
use crate::layout::DataLayout;
use crate::ledger::DeploymentLedger;

/// Entry script names, in order of preference.
pub const ENTRY_SCRIPTS: [&str; 2] = ["_worker.wasm", "_worker.wat"];

/// A site resolved for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSite {
    pub site: Site,
    /// Canonical path of the live release. Fixed for the whole request.
    pub root: PathBuf,
    /// Present for dynamic sites.
    pub entry_script: Option<PathBuf>,
}

impl ResolvedSite {
    pub fn is_dynamic(&self) -> bool {
        self.entry_script.is_some()
    }
}

#[derive(Clone)]
pub struct SiteRegistry {
    layout: DataLayout,
    ledger: Arc<dyn DeploymentLedger>,
    policy: LabelPolicy,
}

impl SiteRegistry {
    pub fn new(layout: DataLayout, ledger: Arc<dyn DeploymentLedger>, policy: LabelPolicy) -> Self {
        Self {
            layout,
            ledger,
            policy,
        }
    }

    pub fn policy(&self) -> &LabelPolicy {
        &self.policy
    }

    /// Resolve `label` to its live release. `None` for invalid, reserved,
    /// and unknown labels alike.
    pub fn resolve(&self, label: &str) -> RegistryResult<Option<ResolvedSite>> {
        let Ok(id) = self.policy.check(label) else {
            return Ok(None);
        };
        let Some(site) = self.ledger.site(&id)? else {
            return Ok(None);
        };
        let site_layout = self.layout.site(&id);
        // `current` is swapped before the deploy is recorded; until the
        // record commits, keep serving the recorded release.
        let seq = match site_layout.current_release()? {
            Some(seq) if seq > site.current_release => {
                debug!(site = %id, seq, recorded = site.current_release, "current is ahead of the ledger");
                site.current_release
            }
            Some(seq) => seq,
            None => {
                warn!(site = %id, "site is registered but has no current release");
                return Ok(None);
            }
        };
        let Some(root) = site_layout.release_root(seq)? else {
            warn!(site = %id, seq, "live release is missing on disk");
            return Ok(None);
        };
        let entry_script = ENTRY_SCRIPTS
            .iter()
            .map(|name| root.join(name))
            .find(|path| path.is_file());
        Ok(Some(ResolvedSite {
            site,
            root,
            entry_script,
        }))
    }

    /// The site row for `label`, without touching the filesystem.
    pub fn site(&self, label: &str) -> RegistryResult<Option<Site>> {
        match self.policy.check(label) {
            Ok(id) => Ok(self.ledger.site(&id)?),
            Err(_) => Ok(None),
        }
    }

    pub fn sites(&self) -> RegistryResult<Vec<Site>> {
        Ok(self.ledger.sites()?)
    }

    /// Deployment history for `label`, oldest first. `None` for unknown sites.
    pub fn deployments(&self, label: &str) -> RegistryResult<Option<Vec<DeploymentRecord>>> {
        let Ok(id) = self.policy.check(label) else {
            return Ok(None);
        };
        if self.ledger.site(&id)?.is_none() {
            return Ok(None);
        }
        Ok(Some(self.ledger.deployments(&id)?))
    }
}
