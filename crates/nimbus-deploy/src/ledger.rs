//! Persistence seam for the registry and the pipeline.

use nimbus_core::{DeploymentRecord, Site, SiteId};
use nimbus_state::{StateResult, StateStore};

/// Site rows and deployment history.
///
/// `record_deployment` must write the site row and the record in one
/// transaction: either both land or neither does.
pub trait DeploymentLedger: Send + Sync {
    fn site(&self, id: &SiteId) -> StateResult<Option<Site>>;

    fn sites(&self) -> StateResult<Vec<Site>>;

    fn latest_sequence(&self, id: &SiteId) -> StateResult<Option<u64>>;

    fn record_deployment(&self, site: &Site, record: &DeploymentRecord) -> StateResult<()>;

    fn deployments(&self, id: &SiteId) -> StateResult<Vec<DeploymentRecord>>;
}

impl DeploymentLedger for StateStore {
    fn site(&self, id: &SiteId) -> StateResult<Option<Site>> {
        self.get_site(id)
    }

    fn sites(&self) -> StateResult<Vec<Site>> {
        self.list_sites()
    }

    fn latest_sequence(&self, id: &SiteId) -> StateResult<Option<u64>> {
        self.latest_deployment_seq(id)
    }

    fn record_deployment(&self, site: &Site, record: &DeploymentRecord) -> StateResult<()> {
        StateStore::record_deployment(self, site, record)
    }

    fn deployments(&self, id: &SiteId) -> StateResult<Vec<DeploymentRecord>> {
        self.list_deployments(id)
    }
}
