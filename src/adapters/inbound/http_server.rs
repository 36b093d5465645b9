//! Guarded HTTP Server
//!
//! Axum middleware that puts `TrafficGuard` in front of an application's
//! routes, plus the `/metrics` endpoint and the serve loop.

use crate::adapters::outbound::PrometheusMetricsStore;
use crate::application::{RequestInfo, TrafficGuard};
use crate::infrastructure::ShutdownController;
use axum::{
    extract::{ConnectInfo, Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Response extension weighting the usage increment of a request.
///
/// Handlers that serve several queries in one call insert this into their
/// response; requests without it count as one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryCount(pub u64);

/// Middleware state.
#[derive(Clone)]
pub struct GuardState {
    pub guard: Arc<TrafficGuard>,
    pub shutdown: ShutdownController,
}

/// Wrap `app` with the traffic guard.
pub fn guarded(app: Router, state: GuardState) -> Router {
    app.layer(middleware::from_fn_with_state(state, guard_middleware))
}

/// Router serving Prometheus metrics at `/metrics`.
pub fn metrics_router(store: Arc<PrometheusMetricsStore>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(store)
}

async fn metrics_handler(State(store): State<Arc<PrometheusMetricsStore>>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        store.export_prometheus(),
    )
}

async fn guard_middleware(State(state): State<GuardState>, request: Request, next: Next) -> Response {
    let _in_flight = state.shutdown.request_guard();

    let info = request_info(&request);
    let admission = match state.guard.admit(&info) {
        Ok(admission) => admission,
        Err(rejection) => {
            let status = StatusCode::from_u16(rejection.status_code())
                .unwrap_or(StatusCode::TOO_MANY_REQUESTS);
            return status.into_response();
        }
    };

    let response = next.run(request).await;

    let queries = response
        .extensions()
        .get::<QueryCount>()
        .map(|q| q.0)
        .unwrap_or(1);
    state
        .guard
        .complete(admission, response.status().as_u16(), queries);

    response
}

fn request_info(request: &Request) -> RequestInfo {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let query = Query::<HashMap<String, String>>::try_from_uri(request.uri())
        .map(|Query(q)| q)
        .unwrap_or_default();

    RequestInfo {
        method: request.method().as_str().to_string(),
        path: request.uri().path().to_string(),
        client_ip: client_ip(request.headers(), peer),
        query,
    }
}

/// First `X-Forwarded-For` entry, then `X-Real-Ip`, then the peer address.
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> Option<IpAddr> {
    let header_ip = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
    };

    header_ip("x-forwarded-for")
        .or_else(|| header_ip("x-real-ip"))
        .or(peer)
}

/// Serve `app` on `listen_addr` until shutdown.
#[cfg_attr(coverage_nightly, coverage(off))]
pub async fn run(listen_addr: &str, app: Router, shutdown: ShutdownController) -> std::io::Result<()> {
    let app = app.layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(listen_addr).await?;
    tracing::info!("sidecar listening on {}", listen_addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
