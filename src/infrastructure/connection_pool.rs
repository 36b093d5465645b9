//! Round-Robin Connection Pool
//!
//! Holds an ordered list of backend connections and hands out the next live
//! one. Each connection built from an endpoint gets its own health prober.

use crate::infrastructure::connection::{Connection, ConnectionInfo};
use crate::infrastructure::health_checker::{HealthProber, ProbeConfig};
use parking_lot::Mutex;
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Selection state, guarded by one lock.
struct PoolState {
    connections: Vec<Arc<Connection>>,
    /// Next candidate; always `< connections.len()` when non-empty
    cursor: usize,
}

/// Liveness-aware round-robin balancer.
pub struct RoundRobinPool {
    state: Mutex<PoolState>,
    probers: Vec<HealthProber>,
    shutdown: CancellationToken,
}

impl RoundRobinPool {
    /// Build a pool from endpoint URLs, probing each one.
    ///
    /// Every URL is parsed before any prober starts; one bad URL rejects the
    /// whole set.
    pub async fn from_endpoints<I, S>(endpoints: I, config: ProbeConfig) -> Result<Self, PoolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let urls = endpoints
            .into_iter()
            .map(|raw| parse_endpoint(raw.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        let shutdown = CancellationToken::new();
        let mut connections = Vec::with_capacity(urls.len());
        let mut probers = Vec::with_capacity(urls.len());

        for url in urls {
            let connection = Arc::new(Connection::new(url));
            let prober = HealthProber::start(connection.clone(), config, shutdown.clone()).await;
            connections.push(connection);
            probers.push(prober);
        }

        tracing::info!(
            "connection pool ready: {} endpoints, {} live",
            connections.len(),
            connections.iter().filter(|c| !c.is_broken()).count()
        );

        Ok(Self {
            state: Mutex::new(PoolState {
                connections,
                cursor: 0,
            }),
            probers,
            shutdown,
        })
    }

    /// Build a pool over existing connections, without probers.
    pub fn from_connections(connections: Vec<Arc<Connection>>) -> Self {
        Self {
            state: Mutex::new(PoolState {
                connections,
                cursor: 0,
            }),
            probers: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Next live connection in rotation order.
    ///
    /// Scans at most one full lap. The cursor advances for every candidate
    /// examined, live or not.
    pub fn get(&self) -> Result<Arc<Connection>, PoolError> {
        let mut state = self.state.lock();
        let len = state.connections.len();
        if len == 0 {
            return Err(PoolError::NoConnectionAvailable);
        }

        for _ in 0..len {
            let candidate = state.connections[state.cursor].clone();
            state.cursor = (state.cursor + 1) % len;
            if !candidate.is_broken() {
                return Ok(candidate);
            }
        }

        Err(PoolError::NoConnectionAvailable)
    }

    /// Snapshot of every connection and its liveness.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.state
            .lock()
            .connections
            .iter()
            .map(|c| c.info())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Restart every prober with a new interval.
    pub async fn set_probe_interval(&self, interval: Duration) {
        for prober in &self.probers {
            prober.set_interval(interval).await;
        }
    }

    /// Stop all probers and wait for them to exit.
    pub async fn close(&self) {
        self.shutdown.cancel();
        for prober in &self.probers {
            prober.stop().await;
        }
    }
}

impl Drop for RoundRobinPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn parse_endpoint(raw: &str) -> Result<Url, PoolError> {
    let url = Url::parse(raw).map_err(|e| PoolError::InvalidEndpoint {
        endpoint: raw.to_string(),
        reason: e.to_string(),
    })?;

    if url.host_str().is_none() {
        return Err(PoolError::InvalidEndpoint {
            endpoint: raw.to_string(),
            reason: "missing host".to_string(),
        });
    }

    Ok(url)
}

/// Connection pool errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Pool is empty or every connection is broken
    #[error("no connection available")]
    NoConnectionAvailable,

    #[error("invalid endpoint '{endpoint}': {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn conns(n: usize) -> Vec<Arc<Connection>> {
        (0..n)
            .map(|i| {
                Arc::new(Connection::new(
                    Url::parse(&format!("http://10.0.0.{}:8080", i + 1)).unwrap(),
                ))
            })
            .collect()
    }

    fn host(conn: &Connection) -> String {
        conn.endpoint().host_str().unwrap().to_string()
    }

    #[test]
    fn test_empty_pool() {
        let pool = RoundRobinPool::from_connections(Vec::new());
        assert!(pool.is_empty());
        assert_eq!(pool.get().unwrap_err(), PoolError::NoConnectionAvailable);
    }

    #[test]
    fn test_rotation_visits_each_live_connection() {
        let pool = RoundRobinPool::from_connections(conns(3));
        let order: Vec<String> = (0..6).map(|_| host(&pool.get().unwrap())).collect();
        assert_eq!(
            order,
            vec!["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.1", "10.0.0.2", "10.0.0.3"]
        );
    }

    #[test]
    fn test_skips_broken_mid_sequence() {
        let connections = conns(3);
        let pool = RoundRobinPool::from_connections(connections.clone());

        assert_eq!(host(&pool.get().unwrap()), "10.0.0.1");
        assert_eq!(host(&pool.get().unwrap()), "10.0.0.2");

        connections[1].set_broken(true);

        assert_eq!(host(&pool.get().unwrap()), "10.0.0.3");
        assert_eq!(host(&pool.get().unwrap()), "10.0.0.1");
        assert_eq!(host(&pool.get().unwrap()), "10.0.0.3");

        connections[1].set_broken(false);
        assert_eq!(host(&pool.get().unwrap()), "10.0.0.1");
        assert_eq!(host(&pool.get().unwrap()), "10.0.0.2");
    }

    #[test]
    fn test_all_broken_then_recover() {
        let connections = conns(2);
        let pool = RoundRobinPool::from_connections(connections.clone());
        for c in &connections {
            c.set_broken(true);
        }

        assert_eq!(pool.get().unwrap_err(), PoolError::NoConnectionAvailable);
        assert_eq!(pool.get().unwrap_err(), PoolError::NoConnectionAvailable);

        connections[1].set_broken(false);
        assert_eq!(host(&pool.get().unwrap()), "10.0.0.2");
        assert_eq!(host(&pool.get().unwrap()), "10.0.0.2");
    }

    #[test]
    fn test_cursor_advances_on_failure() {
        let connections = conns(3);
        let pool = RoundRobinPool::from_connections(connections.clone());
        for c in &connections {
            c.set_broken(true);
        }
        // A full failed lap leaves the cursor where it started
        assert!(pool.get().is_err());
        connections[0].set_broken(false);
        connections[2].set_broken(false);
        assert_eq!(host(&pool.get().unwrap()), "10.0.0.1");
        assert_eq!(host(&pool.get().unwrap()), "10.0.0.3");
    }

    #[test]
    fn test_connections_is_snapshot() {
        let connections = conns(2);
        let pool = RoundRobinPool::from_connections(connections.clone());

        let snapshot = pool.connections();
        connections[0].set_broken(true);

        assert_eq!(snapshot.len(), 2);
        assert!(!snapshot[0].broken);
        assert!(pool.connections()[0].broken);
    }

    #[test]
    fn test_concurrent_get_rotates_fairly() {
        let pool = Arc::new(RoundRobinPool::from_connections(conns(4)));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|_| host(&pool.get().unwrap()))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut counts = std::collections::HashMap::new();
        for handle in handles {
            for h in handle.join().unwrap() {
                *counts.entry(h).or_insert(0) += 1;
            }
        }
        assert_eq!(counts.len(), 4);
        assert!(counts.values().all(|&n| n == 100));
    }

    #[tokio::test]
    async fn test_from_endpoints_invalid_url_fails_fast() {
        let result = RoundRobinPool::from_endpoints(
            ["http://127.0.0.1:1", "not a url"],
            ProbeConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(PoolError::InvalidEndpoint { .. })));
    }

    #[tokio::test]
    async fn test_from_endpoints_missing_host() {
        let result =
            RoundRobinPool::from_endpoints(["unix:/tmp/socket"], ProbeConfig::default()).await;
        assert!(matches!(result, Err(PoolError::InvalidEndpoint { .. })));
    }

    #[tokio::test]
    async fn test_from_endpoints_probes_each_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live = listener.local_addr().unwrap();
        let _task = tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });
        let dead = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();

        let config = ProbeConfig {
            interval: Duration::from_secs(3600),
            timeout: Duration::from_millis(500),
        };
        let pool = RoundRobinPool::from_endpoints(
            [format!("http://{}", dead), format!("http://{}", live)],
            config,
        )
        .await
        .unwrap();

        let snapshot = pool.connections();
        assert!(snapshot[0].broken);
        assert!(!snapshot[1].broken);

        for _ in 0..3 {
            assert_eq!(pool.get().unwrap().endpoint().port(), Some(live.port()));
        }

        pool.set_probe_interval(Duration::from_millis(50)).await;
        pool.close().await;
    }
}
