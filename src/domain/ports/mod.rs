mod config_store;
mod flow_control_engine;
mod metrics_store;
mod service_registry;
mod usage_sink;

pub use config_store::{ConfigStore, ConfigStoreError};
pub use flow_control_engine::{
    Blocked, ControlBehavior, EngineError, EngineRule, FlowControlEngine, TokenStrategy,
};
pub use metrics_store::{MetricsStore, RequestLabels, RequestOutcome};
pub use service_registry::{RegistryError, ServiceRegistry};
pub use usage_sink::{SinkError, UsagePayload, UsageSink};
