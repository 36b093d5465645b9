mod balanced_client;
mod file_config_store;
mod http_usage_sink;
mod memory_config_store;
mod memory_registry;
mod prometheus_metrics_store;
mod token_bucket_engine;

pub use balanced_client::{BalancedClient, ClientError};
pub use file_config_store::{FileConfigStore, DEFAULT_POLL_INTERVAL};
pub use http_usage_sink::HttpUsageSink;
pub use memory_config_store::InMemoryConfigStore;
pub use memory_registry::InMemoryRegistry;
pub use prometheus_metrics_store::{PrometheusMetricsStore, RequestSeries, DURATION_BUCKETS};
pub use token_bucket_engine::TokenBucketEngine;
