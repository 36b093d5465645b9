//! In-Memory Service Registry
//!
//! Process-local `ServiceRegistry`. Instances are keyed by service and
//! group; subscribers get the full instance list on subscribe and after
//! every membership change.

use crate::domain::entities::ServiceInstance;
use crate::domain::events::{ControlEvent, ControlSender};
use crate::domain::ports::{RegistryError, ServiceRegistry};
use async_trait::async_trait;
use dashmap::DashMap;

type ServiceKey = (String, String);

fn key(service_name: &str, group: &str) -> ServiceKey {
    (service_name.to_string(), group.to_string())
}

/// DashMap-backed registry.
#[derive(Default)]
pub struct InMemoryRegistry {
    instances: DashMap<ServiceKey, Vec<ServiceInstance>>,
    subscribers: DashMap<ServiceKey, Vec<ControlSender>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed instances without notifying anyone.
    pub fn with_instances(instances: impl IntoIterator<Item = ServiceInstance>) -> Self {
        let registry = Self::new();
        for instance in instances {
            registry
                .instances
                .entry(key(&instance.service_name, &instance.group))
                .or_default()
                .push(instance);
        }
        registry
    }

    /// Flip the health flag of a registered instance and notify.
    pub async fn set_healthy(
        &self,
        instance: &ServiceInstance,
        healthy: bool,
    ) -> Result<(), RegistryError> {
        let k = key(&instance.service_name, &instance.group);
        {
            let mut entry = self
                .instances
                .get_mut(&k)
                .ok_or_else(|| RegistryError::NotRegistered(instance.url()))?;
            let target = entry
                .iter_mut()
                .find(|i| i.same_endpoint(instance))
                .ok_or_else(|| RegistryError::NotRegistered(instance.url()))?;
            target.healthy = healthy;
        }
        self.notify(&k).await;
        Ok(())
    }

    pub fn subscriber_count(&self, service_name: &str, group: &str) -> usize {
        self.subscribers
            .get(&key(service_name, group))
            .map(|s| s.len())
            .unwrap_or(0)
    }

    fn snapshot(&self, k: &ServiceKey) -> Vec<ServiceInstance> {
        self.instances.get(k).map(|i| i.clone()).unwrap_or_default()
    }

    /// Push the current list to every subscriber, dropping closed ones.
    async fn notify(&self, k: &ServiceKey) {
        let senders = match self.subscribers.get(k) {
            Some(s) => s.clone(),
            None => return,
        };
        let instances = self.snapshot(k);

        let mut closed = false;
        for sender in &senders {
            if sender
                .send(ControlEvent::InstancesChanged(instances.clone()))
                .await
                .is_err()
            {
                closed = true;
            }
        }

        if closed {
            if let Some(mut subs) = self.subscribers.get_mut(k) {
                subs.retain(|s| !s.is_closed());
            }
        }
    }
}

#[async_trait]
impl ServiceRegistry for InMemoryRegistry {
    async fn register(&self, instance: &ServiceInstance) -> Result<(), RegistryError> {
        let k = key(&instance.service_name, &instance.group);
        {
            let mut entry = self.instances.entry(k.clone()).or_default();
            match entry.iter_mut().find(|i| i.same_endpoint(instance)) {
                Some(existing) => *existing = instance.clone(),
                None => entry.push(instance.clone()),
            }
        }

        tracing::info!(
            service = %instance.service_name,
            group = %instance.group,
            endpoint = %instance.url(),
            "instance registered"
        );
        self.notify(&k).await;
        Ok(())
    }

    async fn deregister(&self, instance: &ServiceInstance) -> Result<(), RegistryError> {
        let k = key(&instance.service_name, &instance.group);
        let removed = {
            let mut entry = self
                .instances
                .get_mut(&k)
                .ok_or_else(|| RegistryError::NotRegistered(instance.url()))?;
            let before = entry.len();
            entry.retain(|i| !i.same_endpoint(instance));
            before != entry.len()
        };

        if !removed {
            return Err(RegistryError::NotRegistered(instance.url()));
        }

        tracing::info!(
            service = %instance.service_name,
            endpoint = %instance.url(),
            "instance deregistered"
        );
        self.notify(&k).await;
        Ok(())
    }

    async fn instances(
        &self,
        service_name: &str,
        group: &str,
    ) -> Result<Vec<ServiceInstance>, RegistryError> {
        self.instances
            .get(&key(service_name, group))
            .map(|i| i.clone())
            .ok_or_else(|| RegistryError::ServiceNotFound {
                service: service_name.to_string(),
                group: group.to_string(),
            })
    }

    async fn subscribe(
        &self,
        service_name: &str,
        group: &str,
        events: ControlSender,
    ) -> Result<(), RegistryError> {
        let k = key(service_name, group);
        let current = self.snapshot(&k);

        events
            .send(ControlEvent::InstancesChanged(current))
            .await
            .map_err(|_| RegistryError::Unavailable("subscriber channel closed".into()))?;

        self.subscribers.entry(k).or_default().push(events);
        tracing::debug!(service = service_name, group, "subscribed to instance changes");
        Ok(())
    }
}
