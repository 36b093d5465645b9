//! Rebalancer
//!
//! The single consumer of control events. Rule documents and instance-list
//! changes from all collaborators arrive on one channel and are applied to
//! the rule store one at a time, in arrival order.

use crate::domain::entities::ServiceInstance;
use crate::domain::events::{ControlEvent, ControlReceiver, ControlSender};
use crate::infrastructure::rule_store::RuleStore;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default capacity of the control intake channel.
pub const DEFAULT_INTAKE_CAPACITY: usize = 64;

/// Serialized applier of control events.
pub struct Rebalancer {
    store: Arc<RuleStore>,
    events: ControlReceiver,
}

impl Rebalancer {
    /// Create the intake channel and its consumer.
    pub fn channel(store: Arc<RuleStore>, capacity: usize) -> (ControlSender, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { store, events: rx })
    }

    /// Spawn the consumer loop.
    ///
    /// Runs until `shutdown` fires or every sender is dropped.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            self.handle(event);
        }

        tracing::debug!("rebalancer stopped");
    }

    fn handle(&self, event: ControlEvent) {
        match event {
            ControlEvent::RuleDocument(document) => {
                tracing::info!("rule document changed");
                // Failures are logged by the store; the old rules stay active
                let _ = self.store.apply_document(&document);
            }
            ControlEvent::InstancesChanged(instances) => {
                let active = live_instances(&instances);
                tracing::info!(
                    total = instances.len(),
                    active,
                    "service instances changed"
                );
                let _ = self.store.apply_instances(active);
            }
        }
    }
}

/// Instances that share the rate-limit budget.
fn live_instances(instances: &[ServiceInstance]) -> usize {
    instances.iter().filter(|i| i.healthy && i.enabled).count()
}
