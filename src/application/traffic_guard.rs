//! Traffic Guard - inbound request use case
//!
//! Decides whether an inbound request may proceed and accounts for it
//! afterwards. This is the primary interface for the inbound adapter.
//!
//! Order of checks:
//! 1. IP filter, only for requests on the filtered path (403)
//! 2. Flow control engine for the request's resource (429)
//!
//! Completion records request metrics and, for resources named by the
//! resource query parameter, increments the usage counters.

use crate::domain::ports::{FlowControlEngine, MetricsStore, RequestLabels, RequestOutcome};
use crate::infrastructure::{IntervalCounter, RuleStore, ThresholdCounter};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// What the guard needs to know about a request.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub method: String,
    pub path: String,
    pub client_ip: Option<IpAddr>,
    pub query: HashMap<String, String>,
}

impl RequestInfo {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_client_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    fn query_value(&self, key: &str) -> Option<&str> {
        if key.is_empty() {
            return None;
        }
        self.query.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }
}

/// Ticket for an admitted request, handed back on completion.
#[derive(Debug)]
pub struct Admission {
    resource: String,
    endpoint: String,
    started: Instant,
    /// Resource came from the resource query parameter
    counted: bool,
}

impl Admission {
    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn counts_usage(&self) -> bool {
        self.counted
    }
}

/// Terminal request-path outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("client not permitted for '{resource}'")]
    Forbidden { resource: String },

    #[error("rate limit exceeded for '{resource}'")]
    TooManyRequests { resource: String },
}

impl Rejection {
    /// HTTP status for this rejection.
    pub fn status_code(&self) -> u16 {
        match self {
            Rejection::Forbidden { .. } => 403,
            Rejection::TooManyRequests { .. } => 429,
        }
    }
}

/// Inbound admission and accounting.
pub struct TrafficGuard {
    rules: Arc<RuleStore>,
    engine: Arc<dyn FlowControlEngine>,
    metrics: Arc<dyn MetricsStore>,
    identity_usage: Arc<ThresholdCounter>,
    resource_usage: Arc<IntervalCounter>,
}

impl TrafficGuard {
    pub fn new(
        rules: Arc<RuleStore>,
        engine: Arc<dyn FlowControlEngine>,
        metrics: Arc<dyn MetricsStore>,
        identity_usage: Arc<ThresholdCounter>,
        resource_usage: Arc<IntervalCounter>,
    ) -> Self {
        Self {
            rules,
            engine,
            metrics,
            identity_usage,
            resource_usage,
        }
    }

    /// Admit or reject a request.
    pub fn admit(&self, request: &RequestInfo) -> Result<Admission, Rejection> {
        let started = Instant::now();
        let active = self.rules.active();

        let (resource, counted) = match active.resource_param().and_then(|p| request.query_value(p)) {
            Some(value) => (value.to_string(), true),
            None => (format!("{}:{}", request.method, request.path), false),
        };

        if active.filter.applies_to(&request.path) {
            let identity = request.query_value(active.filter.url_param());
            if !active.filter.admits(request.client_ip, identity) {
                tracing::debug!(
                    client_ip = ?request.client_ip,
                    identity,
                    path = %request.path,
                    "request rejected by ip filter"
                );
                return Err(self.reject(Rejection::Forbidden { resource }, &request.path, started));
            }
        }

        if self.engine.try_entry(&resource).is_err() {
            tracing::debug!(resource = %resource, "request rejected by flow control");
            return Err(self.reject(
                Rejection::TooManyRequests { resource },
                &request.path,
                started,
            ));
        }

        Ok(Admission {
            resource,
            endpoint: request.path.clone(),
            started,
            counted,
        })
    }

    /// Account for a finished request.
    ///
    /// `queries` weights the usage increment.
    pub fn complete(&self, admission: Admission, status: u16, queries: u64) {
        if admission.counted {
            self.identity_usage.add(&admission.resource, queries);
            self.resource_usage.add(&admission.resource, queries);
        }

        self.metrics.record_request(
            RequestLabels::new(status, admission.endpoint, admission.resource),
            RequestOutcome::Passed,
            admission.started.elapsed(),
        );
    }

    fn reject(&self, rejection: Rejection, endpoint: &str, started: Instant) -> Rejection {
        let resource = match &rejection {
            Rejection::Forbidden { resource } | Rejection::TooManyRequests { resource } => resource,
        };
        self.metrics.record_request(
            RequestLabels::new(rejection.status_code(), endpoint, resource.clone()),
            RequestOutcome::Blocked,
            started.elapsed(),
        );
        rejection
    }
}
