//! Active Health Prober
//!
//! One prober per connection. It runs a TCP reachability check on a fixed
//! interval and writes the result into the connection's liveness flag.
//!
//! Each running loop is a *generation* with its own cancellation token.
//! Changing the interval retires the current generation (cancel, then wait
//! for the task to exit) before the next one is spawned, so two timers never
//! fire for the same connection.

use crate::infrastructure::connection::Connection;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Probe timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Interval between probes
    pub interval: Duration,
    /// Timeout for each probe
    pub timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(5),
        }
    }
}

/// A running probe loop.
struct Generation {
    interval: Duration,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodic liveness prober for a single connection.
pub struct HealthProber {
    connection: Arc<Connection>,
    timeout: Duration,
    /// Cancelling the parent stops every generation
    parent: CancellationToken,
    generation: Mutex<Option<Generation>>,
}

impl HealthProber {
    /// Probe once, then start the periodic loop.
    ///
    /// The first probe completes before this returns, so the connection
    /// never reports a stale state.
    pub async fn start(
        connection: Arc<Connection>,
        config: ProbeConfig,
        parent: CancellationToken,
    ) -> Self {
        Self::check(&connection, config.timeout).await;

        let generation =
            Self::spawn_generation(connection.clone(), config.interval, config.timeout, &parent);

        Self {
            connection,
            timeout: config.timeout,
            parent,
            generation: Mutex::new(Some(generation)),
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Interval of the running generation, if any.
    pub async fn interval(&self) -> Option<Duration> {
        self.generation.lock().await.as_ref().map(|g| g.interval)
    }

    /// Whether a probe loop is currently alive.
    pub async fn is_running(&self) -> bool {
        self.generation
            .lock()
            .await
            .as_ref()
            .map(|g| !g.handle.is_finished())
            .unwrap_or(false)
    }

    /// Restart probing with a new interval.
    pub async fn set_interval(&self, interval: Duration) {
        let mut slot = self.generation.lock().await;

        if let Some(old) = slot.take() {
            Self::retire(old).await;
        }

        *slot = Some(Self::spawn_generation(
            self.connection.clone(),
            interval,
            self.timeout,
            &self.parent,
        ));

        tracing::debug!(
            endpoint = %self.connection.endpoint(),
            ?interval,
            "health prober restarted"
        );
    }

    /// Stop probing. The last probe result stays in place.
    pub async fn stop(&self) {
        if let Some(old) = self.generation.lock().await.take() {
            Self::retire(old).await;
        }
    }

    /// Run one probe now, outside the schedule.
    pub async fn probe_now(&self) -> bool {
        Self::check(&self.connection, self.timeout).await
    }

    fn spawn_generation(
        connection: Arc<Connection>,
        interval: Duration,
        timeout: Duration,
        parent: &CancellationToken,
    ) -> Generation {
        let interval = if interval.is_zero() {
            let fallback = ProbeConfig::default().interval;
            tracing::warn!(
                endpoint = %connection.endpoint(),
                "zero probe interval, using {:?}",
                fallback
            );
            fallback
        } else {
            interval
        };

        let token = parent.child_token();
        let task_token = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            biased;
                            _ = task_token.cancelled() => break,
                            _ = Self::check(&connection, timeout) => {}
                        }
                    }
                }
            }

            tracing::debug!(endpoint = %connection.endpoint(), "health prober stopped");
        });

        Generation {
            interval,
            token,
            handle,
        }
    }

    /// Cancel a generation and wait until its task has exited.
    async fn retire(generation: Generation) {
        generation.token.cancel();
        if let Err(e) = generation.handle.await {
            if e.is_panic() {
                tracing::warn!("health prober task panicked: {}", e);
            }
        }
    }

    /// Probe a connection and record the result. Returns true when live.
    async fn check(connection: &Connection, timeout: Duration) -> bool {
        let result = match connection.probe_addr() {
            Some(addr) => Self::tcp_check(&addr, timeout).await,
            None => Err("endpoint has no host".to_string()),
        };

        let broken = result.is_err();
        if connection.set_broken(broken) {
            match &result {
                Ok(()) => tracing::info!("connection {} is now live", connection.endpoint()),
                Err(e) => tracing::warn!("connection {} is now broken: {}", connection.endpoint(), e),
            }
        }

        !broken
    }

    /// TCP connection check.
    async fn tcp_check(addr: &str, timeout: Duration) -> Result<(), String> {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(mut stream)) => {
                let _ = stream.shutdown().await;
                Ok(())
            }
            Ok(Err(e)) => Err(format!("connection failed: {}", e)),
            Err(_) => Err("connection timeout".to_string()),
        }
    }
}

impl Drop for HealthProber {
    fn drop(&mut self) {
        if let Some(generation) = self.generation.get_mut() {
            generation.token.cancel();
        }
    }
}
