//! Sidecar - startup and shutdown wiring
//!
//! Starting a sidecar:
//! 1. spawns the rebalancer on a fresh control intake
//! 2. loads the rule document (when a rule id is configured) and listens
//!    for changes
//! 3. registers this instance and subscribes to its own service
//! 4. starts the usage flush loop
//!
//! Any collaborator failure during steps 2 and 3 aborts startup. A failed
//! start stops the rebalancer and deregisters the instance if it got that
//! far.

use crate::adapters::outbound::{BalancedClient, ClientError};
use crate::application::traffic_guard::TrafficGuard;
use crate::domain::entities::ServiceInstance;
use crate::domain::events::ControlSender;
use crate::domain::ports::{
    ConfigStore, ConfigStoreError, FlowControlEngine, MetricsStore, RegistryError,
    ServiceRegistry, UsageSink,
};
use crate::infrastructure::{
    EmissionStats, IntervalCounter, ProbeConfig, Rebalancer, RuleStore, RuleStoreError,
    ShutdownController, ThresholdCounter, DEFAULT_INTAKE_CAPACITY, FLUSH_INTERVAL, SEND_LIMIT,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

/// How long shutdown waits for in-flight requests.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Identity and tuning of a sidecar.
#[derive(Debug, Clone)]
pub struct SidecarOptions {
    pub service_name: String,
    pub group: String,
    pub ip: String,
    pub port: u16,
    /// Config id of the rule document; no rules are loaded when unset
    pub rule_id: Option<String>,
    pub probe: ProbeConfig,
    pub usage_flush_interval: Duration,
    pub usage_send_limit: u64,
    pub intake_capacity: usize,
}

impl SidecarOptions {
    pub fn new(service_name: impl Into<String>, group: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        Self {
            service_name: service_name.into(),
            group: group.into(),
            ip: ip.into(),
            port,
            rule_id: None,
            probe: ProbeConfig::default(),
            usage_flush_interval: FLUSH_INTERVAL,
            usage_send_limit: SEND_LIMIT,
            intake_capacity: DEFAULT_INTAKE_CAPACITY,
        }
    }

    pub fn with_rule_id(mut self, rule_id: impl Into<String>) -> Self {
        self.rule_id = Some(rule_id.into());
        self
    }
}

/// External collaborators of a sidecar.
#[derive(Clone)]
pub struct Collaborators {
    pub registry: Arc<dyn ServiceRegistry>,
    pub config: Arc<dyn ConfigStore>,
    pub engine: Arc<dyn FlowControlEngine>,
    pub sink: Arc<dyn UsageSink>,
    pub metrics: Arc<dyn MetricsStore>,
}

/// A running sidecar.
pub struct Sidecar {
    options: SidecarOptions,
    instance: ServiceInstance,
    registry: Arc<dyn ServiceRegistry>,
    rules: Arc<RuleStore>,
    control: ControlSender,
    guard: Arc<TrafficGuard>,
    resource_usage: Arc<IntervalCounter>,
    emissions: Arc<EmissionStats>,
    shutdown: ShutdownController,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Sidecar {
    /// Start a sidecar. Background tasks stop when `shutdown` fires.
    pub async fn start(
        options: SidecarOptions,
        collaborators: Collaborators,
        shutdown: ShutdownController,
        emissions: Arc<EmissionStats>,
    ) -> Result<Self, SidecarError> {
        let rules = Arc::new(RuleStore::new(collaborators.engine.clone()));
        let (control, rebalancer) = Rebalancer::channel(rules.clone(), options.intake_capacity);
        let rebalance = shutdown.child_token();
        let rebalancer_task = rebalancer.spawn(rebalance.clone());

        let instance = ServiceInstance::new(
            options.service_name.clone(),
            options.group.clone(),
            options.ip.clone(),
            options.port,
        );
        if let Err(e) = Self::connect(&options, &collaborators, &rules, &control, &instance).await {
            rebalance.cancel();
            let _ = rebalancer_task.await;
            tracing::error!("sidecar startup failed: {}", e);
            return Err(e);
        }
        let mut tasks = vec![rebalancer_task];

        let resource_usage = Arc::new(IntervalCounter::new(
            options.service_name.clone(),
            collaborators.sink.clone(),
            emissions.clone(),
        ));
        tasks.push(
            resource_usage
                .clone()
                .spawn_flush_loop(options.usage_flush_interval, shutdown.child_token()),
        );

        let identity_usage = Arc::new(ThresholdCounter::with_limit(
            options
                .rule_id
                .clone()
                .unwrap_or_else(|| options.service_name.clone()),
            options.usage_send_limit,
            collaborators.sink.clone(),
            emissions.clone(),
        ));

        let guard = Arc::new(TrafficGuard::new(
            rules.clone(),
            collaborators.engine.clone(),
            collaborators.metrics.clone(),
            identity_usage,
            resource_usage.clone(),
        ));

        tracing::info!(
            service = %options.service_name,
            group = %options.group,
            endpoint = %instance.url(),
            "sidecar started"
        );

        Ok(Self {
            options,
            instance,
            registry: collaborators.registry,
            rules,
            control,
            guard,
            resource_usage,
            emissions,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    /// Load rules, register and subscribe. Registration is undone when the
    /// subscription fails.
    async fn connect(
        options: &SidecarOptions,
        collaborators: &Collaborators,
        rules: &RuleStore,
        control: &ControlSender,
        instance: &ServiceInstance,
    ) -> Result<(), SidecarError> {
        if let Some(rule_id) = &options.rule_id {
            let document = collaborators
                .config
                .get_config(rule_id)
                .await
                .map_err(SidecarError::ConfigInit)?;
            rules.apply_document(&document).map_err(SidecarError::Rules)?;

            collaborators
                .config
                .listen(rule_id, control.clone())
                .await
                .map_err(SidecarError::ConfigInit)?;
            tracing::info!(rule_id = %rule_id, "rule document loaded");
        }

        collaborators
            .registry
            .register(instance)
            .await
            .map_err(SidecarError::RegistryInit)?;

        if let Err(e) = collaborators
            .registry
            .subscribe(&options.service_name, &options.group, control.clone())
            .await
        {
            if let Err(undo) = collaborators.registry.deregister(instance).await {
                tracing::warn!("deregistration after failed subscribe failed: {}", undo);
            }
            return Err(SidecarError::RegistryInit(e));
        }
        Ok(())
    }

    pub fn rules(&self) -> &Arc<RuleStore> {
        &self.rules
    }

    /// Sender for injecting control events into the rebalancer.
    pub fn control(&self) -> ControlSender {
        self.control.clone()
    }

    pub fn guard(&self) -> &Arc<TrafficGuard> {
        &self.guard
    }

    pub fn instance(&self) -> &ServiceInstance {
        &self.instance
    }

    pub fn emission_stats(&self) -> &Arc<EmissionStats> {
        &self.emissions
    }

    /// Client balancing over the live instances of another service.
    pub async fn service_client(&self, service_name: &str, group: &str) -> Result<BalancedClient, SidecarError> {
        let instances = self
            .registry
            .instances(service_name, group)
            .await
            .map_err(SidecarError::RegistryInit)?;

        BalancedClient::from_instances(&instances, self.options.probe)
            .await
            .map_err(SidecarError::Client)
    }

    /// Stop background work, flush usage and deregister.
    pub async fn shutdown(&self) {
        self.shutdown.shutdown();

        if !self.shutdown.wait_for_drain(DRAIN_TIMEOUT).await {
            tracing::warn!("shutting down with requests still in flight");
        }

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("background task ended abnormally: {}", e);
            }
        }

        if let Some(flush) = self.resource_usage.flush() {
            let _ = flush.await;
        }

        if let Err(e) = self.registry.deregister(&self.instance).await {
            tracing::warn!("deregistration failed: {}", e);
        }

        tracing::info!(
            sent = self.emissions.sent(),
            failed = self.emissions.failed(),
            "sidecar stopped"
        );
    }
}

/// Startup failures.
#[derive(Debug, Error)]
pub enum SidecarError {
    #[error("registry initialization failed: {0}")]
    RegistryInit(#[source] RegistryError),

    #[error("config initialization failed: {0}")]
    ConfigInit(#[source] ConfigStoreError),

    #[error("initial rule document rejected: {0}")]
    Rules(#[source] RuleStoreError),

    #[error("service client unavailable: {0}")]
    Client(#[source] ClientError),
}
