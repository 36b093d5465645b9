//! Rule Store
//!
//! Holds the current rule set and the IP filter snapshot derived from it.
//! Both are published together by swapping one `Arc`, so a reader sees
//! either the old pair or the new pair and never a mix. Writers are
//! serialized by a lock that readers never touch.

use crate::domain::entities::{RuleDecodeError, RuleSet};
use crate::domain::ports::{EngineError, EngineRule, FlowControlEngine};
use crate::domain::services::{rebalance, FilterSnapshot};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// One published generation of rules.
#[derive(Debug, Default)]
pub struct ActiveRules {
    /// `None` until the first document decodes
    pub rules: Option<Arc<RuleSet>>,
    pub filter: Arc<FilterSnapshot>,
}

impl ActiveRules {
    /// Query key naming the rate-limited resource, if configured.
    pub fn resource_param(&self) -> Option<&str> {
        self.rules
            .as_ref()
            .map(|r| r.resource_param.as_str())
            .filter(|p| !p.is_empty())
    }
}

/// Many-reader, one-writer store of flow-control and IP-filter rules.
pub struct RuleStore {
    active: ArcSwap<ActiveRules>,
    /// Last observed live instance count; 0 until the registry reports
    observed_instances: AtomicUsize,
    engine: Arc<dyn FlowControlEngine>,
    write_lock: Mutex<()>,
}

impl RuleStore {
    /// Create an empty store in the "not yet loaded" state.
    pub fn new(engine: Arc<dyn FlowControlEngine>) -> Self {
        Self {
            active: ArcSwap::from_pointee(ActiveRules::default()),
            observed_instances: AtomicUsize::new(0),
            engine,
            write_lock: Mutex::new(()),
        }
    }

    /// Current rules and filter, as one consistent pair.
    pub fn active(&self) -> Arc<ActiveRules> {
        self.active.load_full()
    }

    /// Current rule set, or `None` before the first successful load.
    pub fn current(&self) -> Option<Arc<RuleSet>> {
        self.active.load().rules.clone()
    }

    /// Current IP filter snapshot.
    pub fn filter(&self) -> Arc<FilterSnapshot> {
        self.active.load().filter.clone()
    }

    /// Instance count used for rebalancing (1 when nothing observed yet).
    pub fn observed_instances(&self) -> usize {
        self.observed_instances.load(Ordering::Acquire).max(1)
    }

    /// Decode and publish a new rule document.
    ///
    /// The engine receives the rules rebalanced for the last observed
    /// instance count first; the rule set and filter snapshot are replaced
    /// only once it accepts them. On any failure the previous rules, filter
    /// and engine state stay in place.
    pub fn apply_document(&self, document: &str) -> Result<(), RuleStoreError> {
        let rules = match RuleSet::decode(document) {
            Ok(rules) => rules,
            Err(e) => {
                tracing::warn!("rule reload rejected, keeping previous rules: {}", e);
                return Err(e.into());
            }
        };

        let _guard = self.write_lock.lock();

        if let Err(e) = self.push_rules(&rules, self.observed_instances()) {
            tracing::warn!("rule reload rejected by engine, keeping previous rules");
            return Err(e);
        }

        let filter = Arc::new(FilterSnapshot::from_options(&rules.ip_filter_rules));
        let rules = Arc::new(rules);

        tracing::info!(
            resource_param = %rules.resource_param,
            flow_rules = rules.flow_control_rules.len(),
            filter_path = %rules.ip_filter_rules.url_path,
            "rule set reloaded"
        );

        self.active.store(Arc::new(ActiveRules {
            rules: Some(rules),
            filter,
        }));
        Ok(())
    }

    /// Record a new live instance count and push rebalanced thresholds.
    ///
    /// The stored rule set keeps its original thresholds.
    pub fn apply_instances(&self, active: usize) -> Result<(), RuleStoreError> {
        let _guard = self.write_lock.lock();

        self.observed_instances.store(active, Ordering::Release);

        let Some(rules) = self.current() else {
            tracing::debug!(active, "instance count recorded before any rules loaded");
            return Ok(());
        };

        self.push_rules(&rules, active)
    }

    fn push_rules(&self, rules: &RuleSet, active: usize) -> Result<(), RuleStoreError> {
        let balanced = rebalance(&rules.flow_control_rules, active);

        tracing::info!(
            active_instances = active.max(1),
            thresholds = ?balanced
                .iter()
                .map(|r| (r.resource.as_str(), r.threshold))
                .collect::<Vec<_>>(),
            "applying flow control rules"
        );

        let engine_rules = balanced.iter().map(EngineRule::from).collect();
        self.engine.load_rules(engine_rules).map_err(|e| {
            tracing::error!("flow control engine rejected rules: {}", e);
            RuleStoreError::Engine(e)
        })
    }
}

/// Errors from applying rule changes.
#[derive(Debug, Error)]
pub enum RuleStoreError {
    #[error(transparent)]
    Decode(#[from] RuleDecodeError),

    #[error("failed to load rules into engine: {0}")]
    Engine(#[from] EngineError),
}
