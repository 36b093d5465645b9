//! In-Memory Config Store
//!
//! Keeps documents in a map; `publish` replaces a document and pushes it to
//! the listeners of that id.

use crate::domain::events::{ControlEvent, ControlSender};
use crate::domain::ports::{ConfigStore, ConfigStoreError};
use async_trait::async_trait;
use dashmap::DashMap;

#[derive(Default)]
pub struct InMemoryConfigStore {
    documents: DashMap<String, String>,
    listeners: DashMap<String, Vec<ControlSender>>,
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `document` under `id` and notify its listeners.
    pub async fn publish(&self, id: &str, document: impl Into<String>) {
        let document = document.into();
        self.documents.insert(id.to_string(), document.clone());

        let listeners = match self.listeners.get(id) {
            Some(l) => l.clone(),
            None => return,
        };

        for listener in listeners {
            if listener
                .send(ControlEvent::RuleDocument(document.clone()))
                .await
                .is_err()
            {
                tracing::debug!(config = id, "dropping closed config listener");
            }
        }

        if let Some(mut l) = self.listeners.get_mut(id) {
            l.retain(|s| !s.is_closed());
        }
    }

    /// Listeners of `id` whose receiver is still alive.
    pub fn listener_count(&self, id: &str) -> usize {
        self.listeners
            .get(id)
            .map(|l| l.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn get_config(&self, id: &str) -> Result<String, ConfigStoreError> {
        self.documents
            .get(id)
            .map(|d| d.clone())
            .ok_or_else(|| ConfigStoreError::NotFound(id.to_string()))
    }

    async fn listen(&self, id: &str, events: ControlSender) -> Result<(), ConfigStoreError> {
        self.listeners.entry(id.to_string()).or_default().push(events);
        Ok(())
    }
}
