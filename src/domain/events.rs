//! Control Events
//!
//! Rule-document and instance-set changes reach the sidecar through one
//! intake channel, consumed by a single rebalancing task.

use crate::domain::entities::ServiceInstance;
use tokio::sync::mpsc;

/// A change notification from an external collaborator.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    /// The rule document was replaced (raw, not yet decoded)
    RuleDocument(String),
    /// Full current instance list of the subscribed service
    InstancesChanged(Vec<ServiceInstance>),
}

/// Sending half of the control intake, handed to collaborators.
pub type ControlSender = mpsc::Sender<ControlEvent>;

/// Receiving half of the control intake.
pub type ControlReceiver = mpsc::Receiver<ControlEvent>;
