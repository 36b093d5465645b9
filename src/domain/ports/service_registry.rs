//! Service Registry Port
//!
//! Defines the interface to the service-discovery collaborator.

use crate::domain::entities::ServiceInstance;
use crate::domain::events::ControlSender;
use async_trait::async_trait;
use thiserror::Error;

/// Registry for service instances.
///
/// This is an outbound port. The discovery protocol and its transport live
/// behind it; the sidecar only registers itself, lists instances and
/// subscribes to membership changes.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Register an instance under its service name and group.
    async fn register(&self, instance: &ServiceInstance) -> Result<(), RegistryError>;

    /// Remove an instance from the registry.
    async fn deregister(&self, instance: &ServiceInstance) -> Result<(), RegistryError>;

    /// Current instances of a service.
    async fn instances(
        &self,
        service_name: &str,
        group: &str,
    ) -> Result<Vec<ServiceInstance>, RegistryError>;

    /// Subscribe to membership changes of a service.
    ///
    /// Every change is delivered as `ControlEvent::InstancesChanged` carrying
    /// the full current instance list.
    async fn subscribe(
        &self,
        service_name: &str,
        group: &str,
        events: ControlSender,
    ) -> Result<(), RegistryError>;
}

/// Errors returned by registry implementations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    #[error("service {service}@{group} not found")]
    ServiceNotFound { service: String, group: String },

    #[error("instance {0} is not registered")]
    NotRegistered(String),
}
