//! Metrics Store Port
//!
//! Defines the interface for recording request-path outcomes.

use std::time::Duration;

/// Labels attached to every request series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestLabels {
    pub status: u16,
    pub endpoint: String,
    pub resource: String,
}

impl RequestLabels {
    pub fn new(status: u16, endpoint: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            status,
            endpoint: endpoint.into(),
            resource: resource.into(),
        }
    }
}

/// Whether a request went through or was stopped by the sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Passed,
    Blocked,
}

/// Store for request counters.
///
/// This is an outbound port; the exposition format belongs to the adapter.
pub trait MetricsStore: Send + Sync {
    /// Record one finished request.
    fn record_request(&self, labels: RequestLabels, outcome: RequestOutcome, elapsed: Duration);
}
