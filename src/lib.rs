//! flowguard Library
//!
//! Traffic-control sidecar: round-robin connection pooling with active
//! health probing, hot-reloaded rate-limit and IP-filter rules rebalanced
//! across live instances, and batched usage reporting.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{Sidecar, SidecarError, SidecarOptions, TrafficGuard};
pub use config::load_config;
pub use domain::entities::{FilterOptions, FlowControlRule, RuleSet, ServiceInstance};
pub use domain::events::ControlEvent;
pub use domain::ports::{ConfigStore, FlowControlEngine, MetricsStore, ServiceRegistry, UsageSink};
pub use infrastructure::{RoundRobinPool, RuleStore};
