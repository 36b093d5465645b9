//! Graceful Shutdown
//!
//! One root cancellation token fans out to every background task (probers,
//! flush loop, rule watcher, rebalancer). In-flight guarded requests are
//! tracked so shutdown can wait for them before deregistering.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Shutdown coordinator.
#[derive(Clone)]
pub struct ShutdownController {
    root: CancellationToken,
    in_flight: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            drained: Arc::new(Notify::new()),
        }
    }

    /// Token cancelled when shutdown starts. Cancelling the child does not
    /// affect the controller.
    pub fn child_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    /// Begin shutdown. Idempotent.
    pub fn shutdown(&self) {
        if !self.root.is_cancelled() {
            tracing::info!("initiating graceful shutdown");
            self.root.cancel();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Resolves once shutdown has started.
    pub async fn cancelled(&self) {
        self.root.cancelled().await
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Track one in-flight request until the guard drops.
    pub fn request_guard(&self) -> RequestGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        RequestGuard {
            controller: self.clone(),
        }
    }

    fn request_ended(&self) {
        let prev = self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 && self.is_shutdown() {
            self.drained.notify_waiters();
        }
    }

    /// Wait for in-flight requests to finish, up to `timeout`.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let notified = self.drained.notified();
        if self.in_flight() == 0 {
            return true;
        }

        tokio::select! {
            _ = notified => true,
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!("drain timeout: {} requests still in flight", self.in_flight());
                false
            }
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight count when dropped.
pub struct RequestGuard {
    controller: ShutdownController,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.controller.request_ended();
    }
}

/// Wait for Ctrl+C or SIGTERM, then shut down.
#[cfg_attr(coverage_nightly, coverage(off))]
pub async fn shutdown_signal(controller: ShutdownController) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C"),
        _ = terminate => tracing::info!("received SIGTERM"),
        _ = controller.cancelled() => return,
    }

    controller.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_controller() {
        let controller = ShutdownController::default();
        assert!(!controller.is_shutdown());
        assert_eq!(controller.in_flight(), 0);
    }

    #[test]
    fn test_shutdown_cancels_children() {
        let controller = ShutdownController::new();
        let child = controller.child_token();

        controller.shutdown();
        assert!(controller.is_shutdown());
        assert!(child.is_cancelled());

        controller.shutdown();
        assert!(controller.is_shutdown());
    }

    #[test]
    fn test_child_cancel_does_not_propagate_up() {
        let controller = ShutdownController::new();
        controller.child_token().cancel();
        assert!(!controller.is_shutdown());
    }

    #[test]
    fn test_request_guards() {
        let controller = ShutdownController::new();
        let a = controller.request_guard();
        let b = controller.request_guard();
        assert_eq!(controller.in_flight(), 2);

        drop(a);
        assert_eq!(controller.in_flight(), 1);
        drop(b);
        assert_eq!(controller.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_drain_immediate() {
        let controller = ShutdownController::new();
        controller.shutdown();
        assert!(controller.wait_for_drain(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_wait_for_drain_after_guard_drops() {
        let controller = ShutdownController::new();
        let guard = controller.request_guard();
        controller.shutdown();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
        });

        assert!(controller.wait_for_drain(Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn test_wait_for_drain_timeout() {
        let controller = ShutdownController::new();
        let _guard = controller.request_guard();
        controller.shutdown();
        assert!(!controller.wait_for_drain(Duration::from_millis(30)).await);
    }

    #[tokio::test]
    async fn test_signal_future_returns_on_programmatic_shutdown() {
        let controller = ShutdownController::new();
        let waiter = tokio::spawn(shutdown_signal(controller.clone()));
        controller.shutdown();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
