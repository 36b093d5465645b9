//! Config Store Port
//!
//! Defines the interface to the configuration collaborator that serves the
//! rule document.

use crate::domain::events::ControlSender;
use async_trait::async_trait;
use thiserror::Error;

/// Store of configuration documents addressed by id.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Fetch the current document for `id`.
    async fn get_config(&self, id: &str) -> Result<String, ConfigStoreError>;

    /// Listen for changes of `id`.
    ///
    /// Each new document is delivered as `ControlEvent::RuleDocument`.
    async fn listen(&self, id: &str, events: ControlSender) -> Result<(), ConfigStoreError>;
}

/// Errors returned by config store implementations.
#[derive(Debug, Error)]
pub enum ConfigStoreError {
    #[error("config '{0}' not found")]
    NotFound(String),

    #[error("failed to read config '{id}': {reason}")]
    Read { id: String, reason: String },
}
