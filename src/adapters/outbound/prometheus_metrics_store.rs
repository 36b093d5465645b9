//! Prometheus Metrics Store
//!
//! Implements MetricsStore with Prometheus text exposition.

use crate::domain::ports::{MetricsStore, RequestLabels, RequestOutcome};
use crate::infrastructure::EmissionStats;
use dashmap::DashMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bounds of the request duration histogram, in seconds.
pub const DURATION_BUCKETS: [f64; 7] = [0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0];

/// Counters for one label set.
#[derive(Debug, Default)]
pub struct RequestSeries {
    pub total: AtomicU64,
    pub passed: AtomicU64,
    pub blocked: AtomicU64,
    /// Cumulative counts per bucket in `DURATION_BUCKETS`
    buckets: [AtomicU64; DURATION_BUCKETS.len()],
    /// Sum of observed durations in microseconds
    duration_sum_us: AtomicU64,
}

impl RequestSeries {
    fn observe(&self, outcome: RequestOutcome, elapsed: Duration) {
        self.total.fetch_add(1, Ordering::Relaxed);
        match outcome {
            RequestOutcome::Passed => self.passed.fetch_add(1, Ordering::Relaxed),
            RequestOutcome::Blocked => self.blocked.fetch_add(1, Ordering::Relaxed),
        };

        let secs = elapsed.as_secs_f64();
        for (bound, bucket) in DURATION_BUCKETS.iter().zip(&self.buckets) {
            if secs <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.duration_sum_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// Cumulative count for the bucket at `index`.
    pub fn bucket(&self, index: usize) -> u64 {
        self.buckets[index].load(Ordering::Relaxed)
    }

    pub fn duration_sum(&self) -> Duration {
        Duration::from_micros(self.duration_sum_us.load(Ordering::Relaxed))
    }
}

/// Prometheus-compatible metrics store.
pub struct PrometheusMetricsStore {
    series: DashMap<RequestLabels, Arc<RequestSeries>>,
    started: Instant,
    emissions: Option<Arc<EmissionStats>>,
}

impl PrometheusMetricsStore {
    pub fn new() -> Self {
        Self {
            series: DashMap::new(),
            started: Instant::now(),
            emissions: None,
        }
    }

    /// Also export the given usage emission outcomes.
    pub fn with_emission_stats(mut self, stats: Arc<EmissionStats>) -> Self {
        self.emissions = Some(stats);
        self
    }

    pub fn series(&self, labels: &RequestLabels) -> Option<Arc<RequestSeries>> {
        self.series.get(labels).map(|e| e.clone())
    }

    fn get_or_create(&self, labels: RequestLabels) -> Arc<RequestSeries> {
        self.series
            .entry(labels)
            .or_insert_with(|| Arc::new(RequestSeries::default()))
            .clone()
    }

    /// Export metrics in Prometheus text format.
    pub fn export_prometheus(&self) -> String {
        let mut series: Vec<(RequestLabels, Arc<RequestSeries>)> = self
            .series
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        series.sort_by(|a, b| a.0.cmp(&b.0));

        let mut output = String::new();

        counter_family(
            &mut output,
            "service_http_req_total",
            "Total inbound requests",
            &series,
            |s| s.total.load(Ordering::Relaxed),
        );
        counter_family(
            &mut output,
            "service_http_passed_total",
            "Requests admitted by the sidecar",
            &series,
            |s| s.passed.load(Ordering::Relaxed),
        );
        counter_family(
            &mut output,
            "service_http_block_total",
            "Requests rejected by the sidecar",
            &series,
            |s| s.blocked.load(Ordering::Relaxed),
        );

        output.push_str("# HELP service_http_request_duration_seconds Request latency\n");
        output.push_str("# TYPE service_http_request_duration_seconds histogram\n");
        for (labels, s) in &series {
            let base = label_pairs(labels);
            for (i, bound) in DURATION_BUCKETS.iter().enumerate() {
                let _ = writeln!(
                    output,
                    "service_http_request_duration_seconds_bucket{{{},le=\"{}\"}} {}",
                    base,
                    bound,
                    s.bucket(i)
                );
            }
            let total = s.total.load(Ordering::Relaxed);
            let _ = writeln!(
                output,
                "service_http_request_duration_seconds_bucket{{{},le=\"+Inf\"}} {}",
                base, total
            );
            let _ = writeln!(
                output,
                "service_http_request_duration_seconds_sum{{{}}} {}",
                base,
                s.duration_sum().as_secs_f64()
            );
            let _ = writeln!(
                output,
                "service_http_request_duration_seconds_count{{{}}} {}",
                base, total
            );
        }

        output.push_str("# HELP service_uptime_seconds Seconds since the sidecar started\n");
        output.push_str("# TYPE service_uptime_seconds gauge\n");
        let _ = writeln!(
            output,
            "service_uptime_seconds {:.3}",
            self.started.elapsed().as_secs_f64()
        );

        if let Some(stats) = &self.emissions {
            output.push_str("# HELP service_usage_emissions_total Usage payloads sent to the collector\n");
            output.push_str("# TYPE service_usage_emissions_total counter\n");
            let _ = writeln!(output, "service_usage_emissions_total{{result=\"sent\"}} {}", stats.sent());
            let _ = writeln!(output, "service_usage_emissions_total{{result=\"failed\"}} {}", stats.failed());
        }

        output
    }
}

fn label_pairs(labels: &RequestLabels) -> String {
    format!(
        "status=\"{}\",endpoint=\"{}\",resource=\"{}\"",
        labels.status,
        escape(&labels.endpoint),
        escape(&labels.resource)
    )
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn counter_family(
    output: &mut String,
    name: &str,
    help: &str,
    series: &[(RequestLabels, Arc<RequestSeries>)],
    value: impl Fn(&RequestSeries) -> u64,
) {
    let _ = writeln!(output, "# HELP {} {}", name, help);
    let _ = writeln!(output, "# TYPE {} counter", name);
    for (labels, s) in series {
        let _ = writeln!(output, "{}{{{}}} {}", name, label_pairs(labels), value(s));
    }
}

impl Default for PrometheusMetricsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsStore for PrometheusMetricsStore {
    fn record_request(&self, labels: RequestLabels, outcome: RequestOutcome, elapsed: Duration) {
        self.get_or_create(labels).observe(outcome, elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(status: u16) -> RequestLabels {
        RequestLabels::new(status, "/q", "client-1")
    }

    #[test]
    fn test_counts_by_outcome() {
        let store = PrometheusMetricsStore::new();
        store.record_request(labels(200), RequestOutcome::Passed, Duration::from_millis(3));
        store.record_request(labels(200), RequestOutcome::Passed, Duration::from_millis(3));
        store.record_request(labels(429), RequestOutcome::Blocked, Duration::ZERO);

        let ok = store.series(&labels(200)).unwrap();
        assert_eq!(ok.total.load(Ordering::Relaxed), 2);
        assert_eq!(ok.passed.load(Ordering::Relaxed), 2);
        assert_eq!(ok.blocked.load(Ordering::Relaxed), 0);

        let blocked = store.series(&labels(429)).unwrap();
        assert_eq!(blocked.blocked.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let store = PrometheusMetricsStore::new();
        store.record_request(labels(200), RequestOutcome::Passed, Duration::from_millis(5));
        store.record_request(labels(200), RequestOutcome::Passed, Duration::from_millis(200));
        store.record_request(labels(200), RequestOutcome::Passed, Duration::from_secs(10));

        let s = store.series(&labels(200)).unwrap();
        assert_eq!(s.bucket(0), 1); // <= 0.01
        assert_eq!(s.bucket(2), 1); // <= 0.1
        assert_eq!(s.bucket(3), 2); // <= 0.25
        assert_eq!(s.bucket(6), 2); // <= 5
        assert_eq!(s.duration_sum(), Duration::from_millis(10_205));
    }

    #[test]
    fn test_export_format() {
        let stats = Arc::new(EmissionStats::default());
        let store = PrometheusMetricsStore::new().with_emission_stats(stats);
        store.record_request(labels(403), RequestOutcome::Blocked, Duration::from_millis(1));

        let output = store.export_prometheus();
        assert!(output.contains("# TYPE service_http_req_total counter"));
        assert!(output
            .contains("service_http_block_total{status=\"403\",endpoint=\"/q\",resource=\"client-1\"} 1"));
        assert!(output.contains(
            "service_http_request_duration_seconds_bucket{status=\"403\",endpoint=\"/q\",resource=\"client-1\",le=\"0.01\"} 1"
        ));
        assert!(output.contains("le=\"+Inf\"} 1"));
        assert!(output.contains("service_uptime_seconds "));
        assert!(output.contains("service_usage_emissions_total{result=\"failed\"} 0"));
    }

    #[test]
    fn test_export_without_emission_stats() {
        let output = PrometheusMetricsStore::default().export_prometheus();
        assert!(!output.contains("service_usage_emissions_total"));
    }

    #[test]
    fn test_label_escaping() {
        let store = PrometheusMetricsStore::new();
        store.record_request(
            RequestLabels::new(200, "/q", "a\"b"),
            RequestOutcome::Passed,
            Duration::ZERO,
        );
        assert!(store.export_prometheus().contains("resource=\"a\\\"b\""));
    }
}
