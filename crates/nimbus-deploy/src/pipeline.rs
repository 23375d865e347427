//! Deployment pipeline.
//!
//! A deploy stages the bundle in a private directory, promotes it to a new
//! release, swaps the site's `current` pointer, and records the result. Any
//! failure before the record is written leaves the previous release live;
//! a failed record write puts the pointer back. The registry only serves
//! recorded releases, so the new one goes live when the record commits.
//!
//! Deploys to one site are serialized by a per-site async mutex, dropped
//! again once the site has no deploy in flight. Different sites never wait
//! on each other.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{error, info, warn};

use nimbus_core::config::DeployConfig;
use nimbus_core::{Actor, DeploymentRecord, LabelPolicy, Site, SiteId, now_millis};

use crate::archive::{ExtractLimits, archive_digest, extract_bundle};
use crate::error::{DeployError, DeployResult};
use crate::layout::{DataLayout, SiteLayout};
use crate::ledger::DeploymentLedger;

/// Releases kept per site, whatever the configuration says. The previous
/// release must survive for readers that resolved it before the swap.
pub const MIN_RETAINED_RELEASES: usize = 2;

/// Pipeline limits.
#[derive(Debug, Clone)]
pub struct DeployLimits {
    pub max_archive_bytes: u64,
    pub extract: ExtractLimits,
    pub retain_releases: usize,
}

impl From<&DeployConfig> for DeployLimits {
    fn from(config: &DeployConfig) -> Self {
        Self {
            max_archive_bytes: config.max_archive_bytes,
            extract: ExtractLimits::from(config),
            retain_releases: config.retain_releases,
        }
    }
}

impl Default for DeployLimits {
    fn default() -> Self {
        Self::from(&DeployConfig::default())
    }
}

type SiteLocks = Mutex<HashMap<SiteId, Arc<tokio::sync::Mutex<()>>>>;

/// Accepts bundles and turns them into live releases.
pub struct Deployer {
    layout: DataLayout,
    ledger: Arc<dyn DeploymentLedger>,
    policy: LabelPolicy,
    limits: DeployLimits,
    locks: SiteLocks,
}

/// Everything the blocking half of a deploy needs.
struct DeployJob {
    site: SiteId,
    site_layout: SiteLayout,
    staging_dir: PathBuf,
    archive: Vec<u8>,
    actor: Actor,
    limits: DeployLimits,
    ledger: Arc<dyn DeploymentLedger>,
}

impl Deployer {
    pub fn new(
        layout: DataLayout,
        ledger: Arc<dyn DeploymentLedger>,
        policy: LabelPolicy,
        limits: DeployLimits,
    ) -> Self {
        Self {
            layout,
            ledger,
            policy,
            limits,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    fn site_locks(&self) -> MutexGuard<'_, HashMap<SiteId, Arc<tokio::sync::Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn site_lock(&self, site: &SiteId) -> Arc<tokio::sync::Mutex<()>> {
        self.site_locks().entry(site.clone()).or_default().clone()
    }

    /// Drop the lock for `site` once no deploy holds or awaits it.
    fn release_site_lock(&self, site: &SiteId) {
        let mut locks = self.site_locks();
        if locks.get(site).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(site);
        }
    }

    /// Sites with a deploy running or queued.
    pub fn busy_sites(&self) -> usize {
        self.site_locks().len()
    }

    /// Deploy `archive` as the new release of `label`.
    pub async fn deploy(
        &self,
        label: &str,
        archive: Vec<u8>,
        actor: Actor,
    ) -> DeployResult<DeploymentRecord> {
        let site = self.policy.check(label)?;

        let size = archive.len() as u64;
        if size > self.limits.max_archive_bytes {
            warn!(%site, size, limit = self.limits.max_archive_bytes, "archive rejected before staging");
            return Err(DeployError::ArchiveTooLarge {
                size,
                limit: self.limits.max_archive_bytes,
            });
        }

        // The guard moves into the blocking task so an abandoned request
        // cannot release the site while its deploy is still running.
        let guard = self.site_lock(&site).lock_owned().await;

        let job = DeployJob {
            site_layout: self.layout.site(&site),
            staging_dir: self.layout.staging_dir(),
            site: site.clone(),
            archive,
            actor,
            limits: self.limits.clone(),
            ledger: self.ledger.clone(),
        };
        let outcome = tokio::task::spawn_blocking(move || {
            let result = job.run();
            drop(guard);
            result
        })
        .await;
        self.release_site_lock(&site);
        outcome.map_err(|e| DeployError::Internal(format!("deploy task failed: {e}")))?
    }
}

impl DeployJob {
    fn run(self) -> DeployResult<DeploymentRecord> {
        let site = &self.site;
        let digest = archive_digest(&self.archive);

        fs::create_dir_all(&self.staging_dir)?;
        let staged = tempfile::Builder::new()
            .prefix(&format!("{site}-"))
            .tempdir_in(&self.staging_dir)?;
        let summary = match extract_bundle(&self.archive, staged.path(), self.limits.extract) {
            Ok(summary) => summary,
            Err(e) => {
                warn!(%site, error = %e, "bundle rejected");
                return Err(e);
            }
        };

        fs::create_dir_all(self.site_layout.releases_dir())?;
        let previous = self.site_layout.current_release()?;
        let on_disk = self.site_layout.releases()?.last().copied();
        let recorded = self.ledger.latest_sequence(site)?;
        let seq = on_disk.max(recorded).unwrap_or(0) + 1;

        let existing = self.ledger.site(site)?;

        let release = self.site_layout.release_dir(seq);
        fs::rename(staged.path(), &release)?;
        // The staged directory is gone; dropping the handle is a no-op.
        drop(staged);

        if let Err(e) = self.site_layout.point_current_at(seq) {
            error!(%site, seq, error = %e, "failed to swap current release");
            discard_release(&release);
            return Err(e.into());
        }

        let now = now_millis();
        let site_row = Site {
            id: site.clone(),
            storage_root: self.site_layout.root().to_path_buf(),
            current_release: seq,
            created_at: existing.map(|s| s.created_at).unwrap_or(now),
            last_deployed_at: now,
        };
        let record = DeploymentRecord {
            id: seq,
            site_id: site.clone(),
            size_bytes: self.archive.len() as u64,
            file_count: summary.file_count,
            deployed_by: self.actor.clone(),
            sha256: digest,
            created_at: now,
        };

        if let Err(e) = self.ledger.record_deployment(&site_row, &record) {
            error!(%site, seq, error = %e, "failed to record deployment, rolling back");
            self.roll_back(previous, &release);
            return Err(e.into());
        }

        let keep = self.limits.retain_releases.max(MIN_RETAINED_RELEASES);
        match self.site_layout.prune(keep, seq) {
            Ok(pruned) if !pruned.is_empty() => info!(%site, ?pruned, "pruned old releases"),
            Ok(_) => {}
            Err(e) => warn!(%site, error = %e, "failed to prune old releases"),
        }

        info!(
            %site,
            seq,
            files = summary.file_count,
            bytes = summary.extracted_bytes,
            actor = %self.actor,
            "deployment live"
        );
        Ok(record)
    }

    fn roll_back(&self, previous: Option<u64>, release: &Path) {
        let restored = match previous {
            Some(seq) => self.site_layout.point_current_at(seq),
            None => self.site_layout.clear_current(),
        };
        if let Err(e) = restored {
            error!(site = %self.site, ?previous, error = %e, "failed to restore previous release");
        }
        discard_release(release);
    }
}

fn discard_release(release: &Path) {
    if let Err(e) = fs::remove_dir_all(release) {
        warn!(path = %release.display(), error = %e, "failed to remove discarded release");
    }
}
