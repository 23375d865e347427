//! nimbus-deploy: site registry and deployment pipeline.
//!
//! - **archive**: containment-checked extraction of gzip'd tar bundles
//! - **layout**: data directory paths, release directories, the `current`
//!   pointer swap and pruning
//! - **ledger**: the persistence seam for site rows and deployment records
//! - **pipeline**: the `Deployer` (stage, promote, swap, record, roll back)
//! - **registry**: label to live release resolution for the router

pub mod archive;
pub mod error;
pub mod layout;
pub mod ledger;
pub mod pipeline;
pub mod registry;

pub use archive::{ExtractLimits, ExtractSummary};
pub use error::{DeployError, DeployResult, RegistryError, RegistryResult};
pub use layout::{DataLayout, SiteLayout};
pub use ledger::DeploymentLedger;
pub use pipeline::{DeployLimits, Deployer};
pub use registry::{ResolvedSite, SiteRegistry};
