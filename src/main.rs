//! flowguard - traffic-control sidecar with hexagonal architecture
//!
//! This is the composition root that wires together all the components.

use axum::{routing::get, Router};
use flowguard::adapters::inbound::{self, GuardState};
use flowguard::adapters::outbound::{
    FileConfigStore, HttpUsageSink, InMemoryRegistry, PrometheusMetricsStore, TokenBucketEngine,
};
use flowguard::application::{Collaborators, Sidecar, SidecarOptions};
use flowguard::config::load_config;
use flowguard::infrastructure::{shutdown_signal, EmissionStats, ProbeConfig, ShutdownController};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::fmt::format::FmtSpan;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    tracing::info!(
        "starting flowguard service={} group={} listen={}",
        cfg.service_name,
        cfg.group,
        cfg.listen_addr
    );

    let port = cfg
        .listen_port()
        .ok_or_else(|| anyhow::anyhow!("listen address '{}' has no port", cfg.listen_addr))?;

    let shutdown = ShutdownController::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    // ===== COMPOSITION ROOT =====

    // 1. Outbound adapters
    let registry = Arc::new(InMemoryRegistry::with_instances(cfg.peer_instances()));

    let config_store = Arc::new(FileConfigStore::new(
        cfg.rule_dir.clone(),
        Duration::from_secs(cfg.rule_poll_secs),
    ));
    config_store.start(shutdown.child_token());

    let emissions = Arc::new(EmissionStats::default());
    let metrics = Arc::new(PrometheusMetricsStore::new().with_emission_stats(emissions.clone()));

    let collaborators = Collaborators {
        registry,
        config: config_store,
        engine: Arc::new(TokenBucketEngine::new()),
        sink: Arc::new(HttpUsageSink::with_timeout(
            cfg.collector_url.clone(),
            Duration::from_millis(cfg.collector_timeout_ms),
        )),
        metrics: metrics.clone(),
    };

    // 2. Sidecar
    let mut options = SidecarOptions::new(
        cfg.service_name.clone(),
        cfg.group.clone(),
        cfg.advertise_ip.clone(),
        port,
    );
    options.rule_id = cfg.rule_id.clone();
    options.probe = ProbeConfig {
        interval: Duration::from_secs(cfg.probe_interval_secs),
        timeout: Duration::from_secs(cfg.probe_timeout_secs),
    };
    options.usage_flush_interval = Duration::from_secs(cfg.usage_flush_secs);
    options.usage_send_limit = cfg.usage_send_limit;

    let sidecar = Sidecar::start(options, collaborators, shutdown.clone(), emissions).await?;

    // 3. Inbound adapter
    let app = Router::new().route("/health", get(|| async { "ok" }));
    let router = inbound::guarded(
        app,
        GuardState {
            guard: sidecar.guard().clone(),
            shutdown: shutdown.clone(),
        },
    )
    .merge(inbound::metrics_router(metrics));

    let served = inbound::run(&cfg.listen_addr, router, shutdown.clone()).await;

    sidecar.shutdown().await;
    served?;
    Ok(())
}
