//! Threshold Rebalancing
//!
//! Spreads each cluster-wide threshold across the live instances of the
//! service so the sum over all instances stays constant.

use crate::domain::entities::FlowControlRule;

/// Per-instance rules for `active_instances` live instances.
///
/// Zero instances is treated as one.
pub fn rebalance(rules: &[FlowControlRule], active_instances: usize) -> Vec<FlowControlRule> {
    let divisor = active_instances.max(1) as f64;
    rules
        .iter()
        .map(|rule| FlowControlRule {
            resource: rule.resource.clone(),
            threshold: rule.threshold / divisor,
        })
        .collect()
}
