//! Activity events.
//!
//! The router emits one [`ActivityEvent`] per dispatched request. Sinks are
//! fire-and-forget: `emit` has no return value and a sink that cannot
//! deliver drops the event with a warning.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::types::now_millis;

/// Resource type tag for every event emitted by the host router.
pub const HOSTING: &str = "hosting";

/// How a request was dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Static,
    Function,
    NotFound,
    BadRequest,
    Timeout,
    Busy,
    Error,
    Admin,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Static => "static",
            Outcome::Function => "function",
            Outcome::NotFound => "not_found",
            Outcome::BadRequest => "bad_request",
            Outcome::Timeout => "timeout",
            Outcome::Busy => "busy",
            Outcome::Error => "error",
            Outcome::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub resource_type: String,
    /// `None` when the request never resolved to a label (admin traffic,
    /// malformed hosts).
    pub site_label: Option<String>,
    /// Unix timestamp (milliseconds).
    pub timestamp: u64,
    pub outcome: Outcome,
}

impl ActivityEvent {
    pub fn hosting(site_label: Option<&str>, outcome: Outcome) -> Self {
        Self {
            resource_type: HOSTING.to_string(),
            site_label: site_label.map(str::to_string),
            timestamp: now_millis(),
            outcome,
        }
    }
}

/// Destination for activity events.
pub trait ActivitySink: Send + Sync {
    fn emit(&self, event: ActivityEvent);
}

/// Writes each event as a structured log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingActivitySink;

impl ActivitySink for TracingActivitySink {
    fn emit(&self, event: ActivityEvent) {
        info!(
            target: "nimbus::activity",
            resource_type = %event.resource_type,
            site = event.site_label.as_deref().unwrap_or("-"),
            outcome = event.outcome.as_str(),
            timestamp = event.timestamp,
            "activity"
        );
    }
}

/// Forwards events over a bounded channel to an external consumer.
#[derive(Debug, Clone)]
pub struct ChannelActivitySink {
    tx: mpsc::Sender<ActivityEvent>,
}

impl ChannelActivitySink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ActivityEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl ActivitySink for ChannelActivitySink {
    fn emit(&self, event: ActivityEvent) {
        if let Err(e) = self.tx.try_send(event) {
            warn!(error = %e, "activity event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_sink_delivers_events() {
        let (sink, mut rx) = ChannelActivitySink::new(4);
        sink.emit(ActivityEvent::hosting(Some("blog"), Outcome::Static));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.resource_type, "hosting");
        assert_eq!(event.site_label.as_deref(), Some("blog"));
        assert_eq!(event.outcome, Outcome::Static);
    }

    #[test]
    fn channel_sink_drops_when_full_or_closed() {
        let (sink, rx) = ChannelActivitySink::new(1);
        sink.emit(ActivityEvent::hosting(None, Outcome::Admin));
        // Full: must not panic or block.
        sink.emit(ActivityEvent::hosting(None, Outcome::Admin));
        drop(rx);
        // Closed: same.
        sink.emit(ActivityEvent::hosting(None, Outcome::Admin));
    }

    #[test]
    fn outcome_serializes_snake_case() {
        let json = serde_json::to_string(&Outcome::NotFound).unwrap();
        assert_eq!(json, "\"not_found\"");
        assert_eq!(Outcome::NotFound.as_str(), "not_found");
    }
}
