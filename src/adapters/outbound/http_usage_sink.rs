//! HTTP Usage Sink
//!
//! Posts usage payloads as JSON to the usage collector.
//!
//! Body shapes:
//! - interval: `{"data": "<json-encoded counts>", "resource": "<source>"}`
//! - threshold: `{"rule_id": "...", "cid": "...", "queries": n}`

use crate::domain::ports::{SinkError, UsagePayload, UsageSink};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Default request timeout for collector calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Serialize)]
struct IntervalBody<'a> {
    data: String,
    resource: &'a str,
}

#[derive(Serialize)]
struct ThresholdBody<'a> {
    rule_id: &'a str,
    cid: &'a str,
    queries: u64,
}

/// Usage sink backed by an HTTP collector endpoint.
pub struct HttpUsageSink {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpUsageSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_timeout(url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn encode(payload: &UsagePayload) -> Result<serde_json::Value, SinkError> {
        let body = match payload {
            UsagePayload::Interval { source, counts } => serde_json::to_value(IntervalBody {
                data: encode_counts(counts)?,
                resource: source,
            })?,
            UsagePayload::Threshold {
                rule_id,
                identity,
                queries,
            } => serde_json::to_value(ThresholdBody {
                rule_id,
                cid: identity,
                queries: *queries,
            })?,
        };
        Ok(body)
    }
}

fn encode_counts(counts: &BTreeMap<String, u64>) -> Result<String, serde_json::Error> {
    serde_json::to_string(counts)
}

#[async_trait]
impl UsageSink for HttpUsageSink {
    async fn emit(&self, payload: UsagePayload) -> Result<(), SinkError> {
        let body = Self::encode(&payload)?;

        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SinkError::Status(status.as_u16()));
        }

        tracing::debug!(url = %self.url, "usage payload delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn interval() -> UsagePayload {
        UsagePayload::Interval {
            source: "orders".into(),
            counts: [("a".to_string(), 3), ("b".to_string(), 1)].into(),
        }
    }

    #[test]
    fn test_encode_interval() {
        let body = HttpUsageSink::encode(&interval()).unwrap();
        assert_eq!(body, json!({"data": "{\"a\":3,\"b\":1}", "resource": "orders"}));
    }

    #[test]
    fn test_encode_threshold() {
        let body = HttpUsageSink::encode(&UsagePayload::Threshold {
            rule_id: "rules".into(),
            identity: "client-9".into(),
            queries: 1000,
        })
        .unwrap();
        assert_eq!(body, json!({"rule_id": "rules", "cid": "client-9", "queries": 1000}));
    }

    #[tokio::test]
    async fn test_emit_posts_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/q"))
            .and(body_json(json!({"data": "{\"a\":3,\"b\":1}", "resource": "orders"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let sink = HttpUsageSink::new(format!("{}/q", server.uri()));
        sink.emit(interval()).await.unwrap();
    }

    #[tokio::test]
    async fn test_emit_reports_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let sink = HttpUsageSink::new(server.uri());
        let err = sink.emit(interval()).await.unwrap_err();
        assert!(matches!(err, SinkError::Status(503)));
    }

    #[tokio::test]
    async fn test_emit_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let sink = HttpUsageSink::with_timeout(server.uri(), Duration::from_millis(50));
        let err = sink.emit(interval()).await.unwrap_err();
        assert!(matches!(err, SinkError::Transport(_)));
    }

    #[tokio::test]
    async fn test_emit_unreachable_collector() {
        let sink = HttpUsageSink::with_timeout("http://127.0.0.1:1/q", Duration::from_millis(200));
        assert!(matches!(
            sink.emit(interval()).await,
            Err(SinkError::Transport(_))
        ));
    }
}
