//! Token Bucket Flow Control Engine
//!
//! In-process `FlowControlEngine`: one token bucket per ruled resource.
//! A bucket holds up to `threshold` tokens (at least one) and refills at
//! `threshold` tokens per stat interval. A threshold of zero rejects every
//! request. Resources without a rule are always admitted.
//!
//! A reload swaps in a whole new bucket map. Resources that survive the
//! reload keep the tokens they have already spent.

use crate::domain::ports::{Blocked, EngineError, EngineRule, FlowControlEngine};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;

/// Per-resource bucket state.
#[derive(Debug)]
struct Bucket {
    capacity: f64,
    /// Tokens added per second
    refill_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
    reject_all: bool,
}

impl Bucket {
    fn new(rule: &EngineRule, now: Instant) -> Self {
        let capacity = rule.threshold.max(1.0);
        Self {
            capacity,
            refill_per_sec: rule.threshold / rule.stat_interval.as_secs_f64(),
            tokens: capacity,
            last_refill: now,
            reject_all: rule.threshold == 0.0,
        }
    }

    /// Bucket for `rule` carrying over what `previous` has spent.
    fn carried(rule: &EngineRule, previous: &mut Bucket, now: Instant) -> Self {
        previous.refill(now);
        let spent = previous.capacity - previous.tokens;

        let mut bucket = Self::new(rule, now);
        bucket.tokens = (bucket.capacity - spent).clamp(0.0, bucket.capacity);
        bucket
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self, now: Instant) -> bool {
        if self.reject_all {
            return false;
        }

        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Token bucket engine keyed by resource name.
#[derive(Debug, Default)]
pub struct TokenBucketEngine {
    buckets: ArcSwap<HashMap<String, Mutex<Bucket>>>,
    /// Serializes reloads so carried state is never lost
    reload: Mutex<()>,
}

impl TokenBucketEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of resources with an active rule.
    pub fn rule_count(&self) -> usize {
        self.buckets.load().len()
    }

    /// Whether `resource` currently has a rule.
    pub fn has_rule(&self, resource: &str) -> bool {
        self.buckets.load().contains_key(resource)
    }

    fn try_entry_at(&self, resource: &str, now: Instant) -> Result<(), Blocked> {
        let buckets = self.buckets.load();
        let Some(bucket) = buckets.get(resource) else {
            return Ok(());
        };

        if bucket.lock().try_take(now) {
            Ok(())
        } else {
            Err(Blocked {
                resource: resource.to_string(),
            })
        }
    }

    fn validate(rule: &EngineRule) -> Result<(), EngineError> {
        let invalid = |reason: &str| EngineError::InvalidRule {
            resource: rule.resource.clone(),
            reason: reason.to_string(),
        };

        if rule.resource.is_empty() {
            return Err(invalid("empty resource name"));
        }
        if !rule.threshold.is_finite() || rule.threshold < 0.0 {
            return Err(invalid("threshold must be a finite non-negative number"));
        }
        if rule.stat_interval.is_zero() {
            return Err(invalid("stat interval must be positive"));
        }
        Ok(())
    }
}

impl FlowControlEngine for TokenBucketEngine {
    /// Replace every bucket in one swap. Nothing changes if any rule is invalid.
    fn load_rules(&self, rules: Vec<EngineRule>) -> Result<(), EngineError> {
        for rule in &rules {
            Self::validate(rule)?;
        }

        let _reload = self.reload.lock();
        let previous = self.buckets.load();
        let now = Instant::now();

        let next: HashMap<String, Mutex<Bucket>> = rules
            .iter()
            .map(|rule| {
                let bucket = match previous.get(&rule.resource) {
                    Some(old) => Bucket::carried(rule, &mut old.lock(), now),
                    None => Bucket::new(rule, now),
                };
                (rule.resource.clone(), Mutex::new(bucket))
            })
            .collect();
        self.buckets.store(next.into());

        tracing::debug!(rules = rules.len(), "flow control rules loaded");
        Ok(())
    }

    fn try_entry(&self, resource: &str) -> Result<(), Blocked> {
        self.try_entry_at(resource, Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::FlowControlRule;
    use std::sync::Arc;
    use std::time::Duration;

    fn rule(resource: &str, threshold: f64) -> EngineRule {
        EngineRule::from(&FlowControlRule::new(resource, threshold))
    }

    fn admitted(engine: &TokenBucketEngine, resource: &str, n: usize, now: Instant) -> usize {
        (0..n)
            .filter(|_| engine.try_entry_at(resource, now).is_ok())
            .count()
    }

    #[test]
    fn test_unruled_resource_passes() {
        let engine = TokenBucketEngine::new();
        for _ in 0..100 {
            assert!(engine.try_entry("anything").is_ok());
        }
    }

    #[test]
    fn test_burst_limited_to_threshold() {
        let engine = TokenBucketEngine::new();
        engine.load_rules(vec![rule("a", 5.0)]).unwrap();

        let now = Instant::now();
        assert_eq!(admitted(&engine, "a", 10, now), 5);

        let err = engine.try_entry_at("a", now).unwrap_err();
        assert_eq!(err.resource, "a");
    }

    #[test]
    fn test_refill_over_interval() {
        let engine = TokenBucketEngine::new();
        engine.load_rules(vec![rule("a", 10.0)]).unwrap();

        let start = Instant::now();
        assert_eq!(admitted(&engine, "a", 10, start), 10);
        assert_eq!(admitted(&engine, "a", 1, start), 0);

        // Half a second refills half the threshold
        let later = start + Duration::from_millis(500);
        assert_eq!(admitted(&engine, "a", 10, later), 5);

        // Never beyond capacity
        let much_later = later + Duration::from_secs(60);
        assert_eq!(admitted(&engine, "a", 50, much_later), 10);
    }

    #[test]
    fn test_zero_threshold_rejects_everything() {
        let engine = TokenBucketEngine::new();
        engine.load_rules(vec![rule("a", 0.0)]).unwrap();

        let now = Instant::now();
        assert_eq!(admitted(&engine, "a", 5, now), 0);
        assert_eq!(admitted(&engine, "a", 5, now + Duration::from_secs(10)), 0);
    }

    #[test]
    fn test_fractional_threshold_admits_at_least_one() {
        let engine = TokenBucketEngine::new();
        engine.load_rules(vec![rule("a", 0.5)]).unwrap();

        let now = Instant::now();
        assert_eq!(admitted(&engine, "a", 3, now), 1);
        assert_eq!(admitted(&engine, "a", 3, now + Duration::from_secs(1)), 0);
        assert_eq!(admitted(&engine, "a", 3, now + Duration::from_secs(2)), 1);
    }

    #[test]
    fn test_load_replaces_rule_set() {
        let engine = TokenBucketEngine::new();
        engine
            .load_rules(vec![rule("a", 1.0), rule("b", 1.0)])
            .unwrap();
        assert_eq!(engine.rule_count(), 2);

        engine.load_rules(vec![rule("b", 3.0)]).unwrap();
        assert_eq!(engine.rule_count(), 1);
        assert!(!engine.has_rule("a"));

        let now = Instant::now();
        assert_eq!(admitted(&engine, "a", 10, now), 10);
        assert_eq!(admitted(&engine, "b", 10, now), 3);
    }

    #[test]
    fn test_reload_keeps_spent_tokens() {
        let engine = TokenBucketEngine::new();
        engine
            .load_rules(vec![rule("a", 5.0), rule("gone", 1.0)])
            .unwrap();

        let start = Instant::now();
        assert_eq!(admitted(&engine, "a", 5, start), 5);
        assert_eq!(admitted(&engine, "gone", 1, start), 1);

        // Same rule again: still drained
        engine.load_rules(vec![rule("a", 5.0)]).unwrap();
        assert_eq!(admitted(&engine, "a", 1, start), 0);

        // Raising the threshold adds only the difference
        engine.load_rules(vec![rule("a", 8.0)]).unwrap();
        assert_eq!(admitted(&engine, "a", 10, start), 3);

        // Dropped resources are unlimited again
        assert!(!engine.has_rule("gone"));
        assert_eq!(admitted(&engine, "gone", 10, start), 10);
    }

    #[test]
    fn test_reload_is_a_single_swap() {
        let engine = TokenBucketEngine::new();
        engine.load_rules(vec![rule("a", 1.0)]).unwrap();
        let before = engine.buckets.load_full();

        engine.load_rules(vec![rule("a", 1.0), rule("b", 1.0)]).unwrap();
        let after = engine.buckets.load_full();

        assert!(!Arc::ptr_eq(&before, &after));
        // The old snapshot is never mutated in place
        assert_eq!(before.len(), 1);
        assert_eq!(after.len(), 2);
    }

    #[test]
    fn test_invalid_rule_leaves_previous_rules() {
        let engine = TokenBucketEngine::new();
        engine.load_rules(vec![rule("a", 2.0)]).unwrap();

        let result = engine.load_rules(vec![rule("b", 1.0), rule("c", f64::NAN)]);
        assert!(matches!(result, Err(EngineError::InvalidRule { ref resource, .. }) if resource == "c"));
        assert!(engine.has_rule("a"));
        assert!(!engine.has_rule("b"));

        let mut zero_window = rule("d", 1.0);
        zero_window.stat_interval = Duration::ZERO;
        assert!(engine.load_rules(vec![zero_window]).is_err());

        assert!(engine.load_rules(vec![rule("", 1.0)]).is_err());
    }
}
