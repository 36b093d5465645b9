//! Flow Control Engine Port
//!
//! The rate-limiting decision algorithm is an external collaborator. The
//! sidecar only loads rules into it and asks it to admit requests.

use crate::domain::entities::FlowControlRule;
use std::time::Duration;
use thiserror::Error;

/// How request tokens are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenStrategy {
    /// Threshold is applied as-is
    #[default]
    Direct,
}

/// What happens once the threshold is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlBehavior {
    /// Excess requests are rejected immediately
    #[default]
    Reject,
}

/// A rule in the engine's own format.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineRule {
    pub resource: String,
    pub threshold: f64,
    pub strategy: TokenStrategy,
    pub behavior: ControlBehavior,
    /// Window the threshold is counted over
    pub stat_interval: Duration,
}

impl From<&FlowControlRule> for EngineRule {
    fn from(rule: &FlowControlRule) -> Self {
        Self {
            resource: rule.resource.clone(),
            threshold: rule.threshold,
            strategy: TokenStrategy::Direct,
            behavior: ControlBehavior::Reject,
            stat_interval: Duration::from_millis(1000),
        }
    }
}

/// Request admission engine.
///
/// `load_rules` has full replacement semantics: the new list becomes the
/// engine's entire active rule set.
pub trait FlowControlEngine: Send + Sync {
    /// Replace the active rule set.
    fn load_rules(&self, rules: Vec<EngineRule>) -> Result<(), EngineError>;

    /// Try to admit one request for `resource`.
    fn try_entry(&self, resource: &str) -> Result<(), Blocked>;
}

/// The engine refused a request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("request to '{resource}' blocked by flow control")]
pub struct Blocked {
    pub resource: String,
}

/// Errors raised while loading rules.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("invalid rule for '{resource}': {reason}")]
    InvalidRule { resource: String, reason: String },
}
