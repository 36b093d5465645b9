//! Balanced Service Client
//!
//! HTTP client for calls to another service. Every request is sent to the
//! connection the round-robin pool hands out; the caller supplies only the
//! path and query.

use crate::domain::entities::ServiceInstance;
use crate::infrastructure::{PoolError, ProbeConfig, RoundRobinPool};
use reqwest::{Method, RequestBuilder, Url};
use std::sync::Arc;
use thiserror::Error;

/// Client bound to one service's connection pool.
#[derive(Clone)]
pub struct BalancedClient {
    pool: Arc<RoundRobinPool>,
    http: reqwest::Client,
}

impl BalancedClient {
    pub fn new(pool: Arc<RoundRobinPool>) -> Self {
        Self {
            pool,
            http: reqwest::Client::new(),
        }
    }

    /// Build a probed pool over the live instances of a service.
    pub async fn from_instances(
        instances: &[ServiceInstance],
        config: ProbeConfig,
    ) -> Result<Self, ClientError> {
        let endpoints: Vec<String> = instances
            .iter()
            .filter(|i| i.healthy && i.enabled)
            .map(|i| i.url())
            .collect();

        let pool = RoundRobinPool::from_endpoints(endpoints, config).await?;
        Ok(Self::new(Arc::new(pool)))
    }

    pub fn pool(&self) -> &Arc<RoundRobinPool> {
        &self.pool
    }

    /// Resolve `path_and_query` against the next live endpoint.
    pub fn target(&self, path_and_query: &str) -> Result<Url, ClientError> {
        let connection = self.pool.get()?;
        connection
            .endpoint()
            .join(path_and_query)
            .map_err(|e| ClientError::InvalidPath {
                path: path_and_query.to_string(),
                reason: e.to_string(),
            })
    }

    /// Start a request to the next live endpoint.
    pub fn request(&self, method: Method, path_and_query: &str) -> Result<RequestBuilder, ClientError> {
        let url = self.target(path_and_query)?;
        tracing::debug!(%method, %url, "balanced request");
        Ok(self.http.request(method, url))
    }

    pub async fn get(&self, path_and_query: &str) -> Result<reqwest::Response, ClientError> {
        Ok(self.request(Method::GET, path_and_query)?.send().await?)
    }
}

/// Errors from balanced calls.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Every backend is broken or none exists
    #[error("no live connection to the service")]
    NoConnection,

    #[error("invalid endpoint: {0}")]
    Pool(PoolError),

    #[error("invalid request path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl From<PoolError> for ClientError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::NoConnectionAvailable => ClientError::NoConnection,
            other => ClientError::Pool(other),
        }
    }
}
