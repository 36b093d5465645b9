//! Infrastructure Layer
//!
//! Stateful runtime components: connection liveness, rule publication,
//! usage batching and shutdown coordination.

pub mod connection;
pub mod connection_pool;
pub mod health_checker;
pub mod rebalancer;
pub mod rule_store;
pub mod shutdown;
pub mod usage_aggregator;

pub use connection::{Connection, ConnectionInfo};
pub use connection_pool::{PoolError, RoundRobinPool};
pub use health_checker::{HealthProber, ProbeConfig};
pub use rebalancer::{Rebalancer, DEFAULT_INTAKE_CAPACITY};
pub use rule_store::{ActiveRules, RuleStore, RuleStoreError};
pub use shutdown::{shutdown_signal, RequestGuard, ShutdownController};
pub use usage_aggregator::{EmissionStats, IntervalCounter, ThresholdCounter, FLUSH_INTERVAL, SEND_LIMIT};
