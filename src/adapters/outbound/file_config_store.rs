//! File Config Store
//!
//! Serves rule documents from files under a directory, one file per config
//! id. Listeners are driven by a polling loop that compares modification
//! times.

use crate::domain::events::{ControlEvent, ControlSender};
use crate::domain::ports::{ConfigStore, ConfigStoreError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Poll interval used when none is configured.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// One listened config file.
struct Watch {
    id: String,
    path: PathBuf,
    last_modified: Option<SystemTime>,
    events: ControlSender,
}

/// Directory-backed config store.
pub struct FileConfigStore {
    dir: PathBuf,
    poll_interval: Duration,
    watches: Arc<Mutex<Vec<Watch>>>,
}

impl FileConfigStore {
    pub fn new(dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            poll_interval,
            watches: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// File backing `id`.
    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    pub fn watched_count(&self) -> usize {
        self.watches.lock().len()
    }

    /// Start the polling loop. Runs until `shutdown` fires.
    ///
    /// A zero poll interval falls back to `DEFAULT_POLL_INTERVAL`.
    pub fn start(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let watches = self.watches.clone();
        let poll_interval = if self.poll_interval.is_zero() {
            tracing::warn!(dir = ?self.dir, "zero poll interval, using {:?}", DEFAULT_POLL_INTERVAL);
            DEFAULT_POLL_INTERVAL
        } else {
            self.poll_interval
        };

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + poll_interval, poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => poll(&watches).await,
                }
            }

            tracing::debug!("config file poller stopped");
        })
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Check every watch and deliver changed documents.
async fn poll(watches: &Mutex<Vec<Watch>>) {
    let changed: Vec<(String, PathBuf, ControlSender)> = {
        let mut watches = watches.lock();
        watches.retain(|w| !w.events.is_closed());

        watches
            .iter_mut()
            .filter_map(|w| {
                let mtime = modified(&w.path)?;
                if w.last_modified.map_or(true, |last| mtime > last) {
                    w.last_modified = Some(mtime);
                    Some((w.id.clone(), w.path.clone(), w.events.clone()))
                } else {
                    None
                }
            })
            .collect()
    };

    for (id, path, events) in changed {
        match tokio::fs::read_to_string(&path).await {
            Ok(document) => {
                tracing::info!(config = %id, ?path, "config file modified");
                let _ = events.send(ControlEvent::RuleDocument(document)).await;
            }
            Err(e) => tracing::warn!(config = %id, "failed to read config file: {}", e),
        }
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn get_config(&self, id: &str) -> Result<String, ConfigStoreError> {
        let path = self.path_for(id);
        tokio::fs::read_to_string(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigStoreError::NotFound(id.to_string())
            } else {
                ConfigStoreError::Read {
                    id: id.to_string(),
                    reason: e.to_string(),
                }
            }
        })
    }

    /// Changes after this call are delivered; the current content is not.
    async fn listen(&self, id: &str, events: ControlSender) -> Result<(), ConfigStoreError> {
        let path = self.path_for(id);
        let last_modified = modified(&path);

        self.watches.lock().push(Watch {
            id: id.to_string(),
            path,
            last_modified,
            events,
        });
        Ok(())
    }
}
