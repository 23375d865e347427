//! nimbus-core: shared building blocks for the Nimbus host.
//!
//! - **config**: `nimbus.toml` parsing into [`NimbusConfig`]
//! - **label**: DNS-label slug validation and the [`SiteId`] newtype
//! - **containment**: the single path-containment check used by both static
//!   serving and archive extraction
//! - **activity**: fire-and-forget activity events and their sinks
//! - **types**: persisted records shared by the registry and the router

pub mod activity;
pub mod config;
pub mod containment;
pub mod label;
pub mod types;

pub use activity::{ActivityEvent, ActivitySink, ChannelActivitySink, Outcome, TracingActivitySink};
pub use config::NimbusConfig;
pub use containment::ContainmentError;
pub use label::{LabelError, LabelPolicy, SiteId};
pub use types::*;
