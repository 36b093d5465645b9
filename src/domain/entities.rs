//! Domain Entities - Core business objects
//!
//! Rule documents, flow-control rules and registry instances. These types
//! carry no runtime state; the infrastructure layer wraps them in snapshots.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A per-resource rate limit, expressed in requests per second.
///
/// The threshold is the cluster-wide budget before rebalancing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowControlRule {
    /// Opaque resource identifier (URL key, query parameter value, ...)
    pub resource: String,
    /// Allowed requests per second
    pub threshold: f64,
}

impl FlowControlRule {
    pub fn new(resource: impl Into<String>, threshold: f64) -> Self {
        Self {
            resource: resource.into(),
            threshold,
        }
    }
}

/// IPs granted access to one specific resource identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthorizedIps {
    /// Resource identity, matched against the `urlParam` query value
    pub resource: String,
    #[serde(default)]
    pub ips: Vec<String>,
}

/// IP filter configuration as it appears in the rule document.
///
/// IP literals are kept as strings here; malformed entries are dropped
/// when the runtime snapshot is built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterOptions {
    #[serde(default, rename = "allowed")]
    pub allowed_ips: Vec<String>,
    #[serde(default, rename = "blocked")]
    pub blocked_ips: Vec<String>,
    /// Only requests on this path are filtered
    #[serde(default, rename = "urlPath")]
    pub url_path: String,
    /// Query key holding the caller identity used for authorization
    #[serde(default, rename = "urlParam")]
    pub url_param: String,
    #[serde(default, rename = "authorized")]
    pub authorized: Vec<AuthorizedIps>,
    #[serde(default, rename = "blockedDefault")]
    pub block_by_default: bool,
}

/// The complete rule document: flow control plus IP filtering.
///
/// Replaced wholesale on every successful reload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    /// Query key whose value names the rate-limited resource
    #[serde(default, rename = "resource-param")]
    pub resource_param: String,
    #[serde(default, rename = "flow-control-rules")]
    pub flow_control_rules: Vec<FlowControlRule>,
    #[serde(default, rename = "ip-filter-rules")]
    pub ip_filter_rules: FilterOptions,
}

impl RuleSet {
    /// Decode a YAML rule document.
    ///
    /// Fails on malformed YAML, on empty resource names and on thresholds
    /// that are negative or not finite, so a bad document is never partially
    /// applied.
    pub fn decode(document: &str) -> Result<Self, RuleDecodeError> {
        let rules: RuleSet = serde_yaml::from_str(document)?;

        for rule in &rules.flow_control_rules {
            if rule.resource.trim().is_empty() {
                return Err(RuleDecodeError::EmptyResource {
                    threshold: rule.threshold,
                });
            }
            if !rule.threshold.is_finite() || rule.threshold < 0.0 {
                return Err(RuleDecodeError::InvalidThreshold {
                    resource: rule.resource.clone(),
                    threshold: rule.threshold,
                });
            }
        }

        Ok(rules)
    }
}

/// Errors produced while decoding a rule document.
#[derive(Debug, Error)]
pub enum RuleDecodeError {
    #[error("malformed rule document: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid threshold {threshold} for resource '{resource}'")]
    InvalidThreshold { resource: String, threshold: f64 },

    #[error("flow control rule with threshold {threshold} has no resource name")]
    EmptyResource { threshold: f64 },
}

/// A service instance as known to the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub service_name: String,
    pub group: String,
    pub ip: String,
    pub port: u16,
    pub weight: f64,
    pub healthy: bool,
    pub enabled: bool,
}

impl ServiceInstance {
    /// Create a healthy, enabled instance with the default weight.
    pub fn new(
        service_name: impl Into<String>,
        group: impl Into<String>,
        ip: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            group: group.into(),
            ip: ip.into(),
            port,
            weight: 10.0,
            healthy: true,
            enabled: true,
        }
    }

    /// Base URL for HTTP calls to this instance.
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.ip, self.port)
    }

    /// Whether two records describe the same endpoint.
    pub fn same_endpoint(&self, other: &ServiceInstance) -> bool {
        self.ip == other.ip && self.port == other.port
    }
}
