//! Usage Aggregator
//!
//! Two batching counters in front of the usage collector:
//!
//! - `IntervalCounter` counts per resource and ships the whole map every
//!   flush interval, then starts over.
//! - `ThresholdCounter` counts per identity and ships one identity's total
//!   the moment it reaches the send limit, resetting only that identity.
//!
//! Emissions run on their own tasks and never reach the caller. Failures,
//! including panics inside the sink, are logged and counted in
//! `EmissionStats`.

use crate::domain::ports::{UsagePayload, UsageSink};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Interval between periodic flushes.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Per-identity total that triggers an emission.
pub const SEND_LIMIT: u64 = 1000;

/// Outcome counters for usage emissions.
#[derive(Debug, Default)]
pub struct EmissionStats {
    sent: AtomicU64,
    failed: AtomicU64,
}

impl EmissionStats {
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Send a payload on a detached task.
///
/// The sink call runs on an inner task so a panic surfaces as a join error
/// instead of tearing anything else down.
fn dispatch(
    sink: Arc<dyn UsageSink>,
    stats: Arc<EmissionStats>,
    payload: UsagePayload,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let outcome = tokio::spawn(async move { sink.emit(payload).await }).await;

        match outcome {
            Ok(Ok(())) => {
                stats.sent.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("usage emission failed: {}", e);
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("usage emission aborted: {}", e);
            }
        }
    })
}

/// Per-resource counter flushed on a fixed interval.
pub struct IntervalCounter {
    source: String,
    counts: Mutex<HashMap<String, u64>>,
    sink: Arc<dyn UsageSink>,
    stats: Arc<EmissionStats>,
}

impl IntervalCounter {
    /// Create a counter whose payloads are tagged with `source`.
    pub fn new(source: impl Into<String>, sink: Arc<dyn UsageSink>, stats: Arc<EmissionStats>) -> Self {
        Self {
            source: source.into(),
            counts: Mutex::new(HashMap::new()),
            sink,
            stats,
        }
    }

    pub fn add(&self, resource: &str, count: u64) {
        *self.counts.lock().entry(resource.to_string()).or_insert(0) += count;
    }

    /// Count accumulated for `resource` since the last flush.
    pub fn count(&self, resource: &str) -> u64 {
        self.counts.lock().get(resource).copied().unwrap_or(0)
    }

    /// Snapshot and clear the map, then emit the snapshot.
    ///
    /// Returns the emission task, or `None` when nothing was counted.
    pub fn flush(&self) -> Option<JoinHandle<()>> {
        let counts = std::mem::take(&mut *self.counts.lock());
        if counts.is_empty() {
            return None;
        }

        tracing::debug!(source = %self.source, resources = counts.len(), "flushing usage counters");

        let payload = UsagePayload::Interval {
            source: self.source.clone(),
            counts: counts.into_iter().collect::<BTreeMap<_, _>>(),
        };
        Some(dispatch(self.sink.clone(), self.stats.clone(), payload))
    }

    /// Flush every `interval` until `shutdown` fires.
    ///
    /// A zero interval falls back to `FLUSH_INTERVAL`.
    pub fn spawn_flush_loop(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let interval = if interval.is_zero() {
            tracing::warn!(source = %self.source, "zero flush interval, using {:?}", FLUSH_INTERVAL);
            FLUSH_INTERVAL
        } else {
            interval
        };

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.flush();
                    }
                }
            }
        })
    }
}

/// Per-identity counter flushed when an identity reaches the send limit.
pub struct ThresholdCounter {
    rule_id: String,
    limit: u64,
    counts: Mutex<HashMap<String, u64>>,
    sink: Arc<dyn UsageSink>,
    stats: Arc<EmissionStats>,
}

impl ThresholdCounter {
    pub fn new(rule_id: impl Into<String>, sink: Arc<dyn UsageSink>, stats: Arc<EmissionStats>) -> Self {
        Self::with_limit(rule_id, SEND_LIMIT, sink, stats)
    }

    pub fn with_limit(
        rule_id: impl Into<String>,
        limit: u64,
        sink: Arc<dyn UsageSink>,
        stats: Arc<EmissionStats>,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            limit: limit.max(1),
            counts: Mutex::new(HashMap::new()),
            sink,
            stats,
        }
    }

    /// Add to an identity's total. Returns true if this triggered an
    /// emission.
    pub fn add(&self, identity: &str, count: u64) -> bool {
        let total = {
            let mut counts = self.counts.lock();
            let entry = counts.entry(identity.to_string()).or_insert(0);
            *entry += count;
            if *entry < self.limit {
                return false;
            }
            std::mem::take(entry)
        };

        tracing::debug!(identity, total, "usage send limit reached");

        let payload = UsagePayload::Threshold {
            rule_id: self.rule_id.clone(),
            identity: identity.to_string(),
            queries: total,
        };
        dispatch(self.sink.clone(), self.stats.clone(), payload);
        true
    }

    pub fn count(&self, identity: &str) -> u64 {
        self.counts.lock().get(identity).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::SinkError;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    // ===== Mock Implementations =====

    struct ChannelSink {
        tx: mpsc::UnboundedSender<UsagePayload>,
    }

    #[async_trait]
    impl UsageSink for ChannelSink {
        async fn emit(&self, payload: UsagePayload) -> Result<(), SinkError> {
            let _ = self.tx.send(payload);
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl UsageSink for FailingSink {
        async fn emit(&self, _payload: UsagePayload) -> Result<(), SinkError> {
            Err(SinkError::Transport("connection refused".into()))
        }
    }

    struct PanickingSink;

    #[async_trait]
    impl UsageSink for PanickingSink {
        async fn emit(&self, _payload: UsagePayload) -> Result<(), SinkError> {
            panic!("collector exploded");
        }
    }

    fn channel_sink() -> (Arc<dyn UsageSink>, mpsc::UnboundedReceiver<UsagePayload>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelSink { tx }), rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<UsagePayload>) -> UsagePayload {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("no emission")
            .expect("sink closed")
    }

    #[tokio::test]
    async fn test_interval_flush_emits_and_clears() {
        let (sink, mut rx) = channel_sink();
        let stats = Arc::new(EmissionStats::default());
        let counter = IntervalCounter::new("svc", sink, stats.clone());

        counter.add("r", 2);
        counter.add("r", 3);
        counter.add("s", 1);

        let handle = counter.flush().unwrap();
        assert_eq!(counter.count("r"), 0);
        assert_eq!(counter.count("s"), 0);

        let payload = next(&mut rx).await;
        let expected: BTreeMap<String, u64> = [("r".to_string(), 5), ("s".to_string(), 1)].into();
        assert_eq!(
            payload,
            UsagePayload::Interval {
                source: "svc".into(),
                counts: expected
            }
        );

        handle.await.unwrap();
        assert_eq!(stats.sent(), 1);
    }

    #[tokio::test]
    async fn test_interval_flush_skips_empty() {
        let (sink, mut rx) = channel_sink();
        let counter = IntervalCounter::new("svc", sink, Arc::new(EmissionStats::default()));
        assert!(counter.flush().is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_flush_loop_runs_on_interval() {
        let (sink, mut rx) = channel_sink();
        let counter = Arc::new(IntervalCounter::new(
            "svc",
            sink,
            Arc::new(EmissionStats::default()),
        ));
        let token = CancellationToken::new();
        let handle = counter
            .clone()
            .spawn_flush_loop(Duration::from_millis(20), token.clone());

        counter.add("r", 7);
        match next(&mut rx).await {
            UsagePayload::Interval { counts, .. } => assert_eq!(counts.get("r"), Some(&7)),
            other => panic!("unexpected payload {:?}", other),
        }

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_loop_zero_interval_uses_default() {
        let (sink, _rx) = channel_sink();
        let counter = Arc::new(IntervalCounter::new(
            "svc",
            sink,
            Arc::new(EmissionStats::default()),
        ));
        let token = CancellationToken::new();
        let handle = counter.spawn_flush_loop(Duration::ZERO, token.clone());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_threshold_emits_at_limit_and_resets_only_identity() {
        let (sink, mut rx) = channel_sink();
        let counter = ThresholdCounter::with_limit("rules", 10, sink, Arc::new(EmissionStats::default()));

        assert!(!counter.add("x", 4));
        assert!(!counter.add("y", 6));
        assert!(!counter.add("x", 5));
        assert!(counter.add("x", 1));

        assert_eq!(counter.count("x"), 0);
        assert_eq!(counter.count("y"), 6);

        assert_eq!(
            next(&mut rx).await,
            UsagePayload::Threshold {
                rule_id: "rules".into(),
                identity: "x".into(),
                queries: 10
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_threshold_emits_total_when_overshooting() {
        let (sink, mut rx) = channel_sink();
        let counter = ThresholdCounter::with_limit("rules", 10, sink, Arc::new(EmissionStats::default()));

        counter.add("x", 8);
        assert!(counter.add("x", 5));

        match next(&mut rx).await {
            UsagePayload::Threshold { queries, .. } => assert_eq!(queries, 13),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_default_limit() {
        let (sink, _rx) = channel_sink();
        let counter = ThresholdCounter::new("rules", sink, Arc::new(EmissionStats::default()));
        assert_eq!(counter.limit, SEND_LIMIT);
    }

    #[tokio::test]
    async fn test_sink_failure_is_counted_not_propagated() {
        let stats = Arc::new(EmissionStats::default());
        let counter = IntervalCounter::new("svc", Arc::new(FailingSink), stats.clone());

        counter.add("r", 1);
        counter.flush().unwrap().await.unwrap();

        assert_eq!(stats.failed(), 1);
        assert_eq!(stats.sent(), 0);
    }

    #[tokio::test]
    async fn test_sink_panic_is_contained() {
        let stats = Arc::new(EmissionStats::default());
        let counter = IntervalCounter::new("svc", Arc::new(PanickingSink), stats.clone());

        counter.add("r", 1);
        counter.flush().unwrap().await.unwrap();

        assert_eq!(stats.failed(), 1);
    }

    #[tokio::test]
    async fn test_threshold_failure_does_not_reach_caller() {
        let stats = Arc::new(EmissionStats::default());
        let counter = ThresholdCounter::with_limit("rules", 1, Arc::new(FailingSink), stats.clone());

        assert!(counter.add("x", 1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(stats.failed(), 1);
    }
}
