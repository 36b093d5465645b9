//! Usage Sink Port
//!
//! Destination of aggregated usage counters.

use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

/// One batch of usage data.
#[derive(Debug, Clone, PartialEq)]
pub enum UsagePayload {
    /// Periodic snapshot of every counted resource
    Interval {
        source: String,
        counts: BTreeMap<String, u64>,
    },
    /// One identity crossed the send limit
    Threshold {
        rule_id: String,
        identity: String,
        queries: u64,
    },
}

/// Collector that receives usage payloads.
///
/// Callers treat every error as non-fatal.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn emit(&self, payload: UsagePayload) -> Result<(), SinkError>;
}

/// Errors returned by sink implementations.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("collector responded with status {0}")]
    Status(u16),
}
