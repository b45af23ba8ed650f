//! Pattern aggregation configuration.

use serde::{Deserialize, Serialize};

/// Bars a pattern must clear to become a fleet-wide default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionPolicy {
    /// Minimum consensus score.
    pub min_consensus_score: f64,

    /// Minimum mean per-instance success rate.
    pub min_success_rate: f64,

    /// Minimum number of distinct reporting instances.
    pub min_instances: usize,

    /// Minimum total reports.
    pub min_usage: u64,
}

impl Default for PromotionPolicy {
    fn default() -> Self {
        Self {
            min_consensus_score: 0.95,
            min_success_rate: 0.95,
            min_instances: 3,
            min_usage: 100,
        }
    }
}

/// Configuration for the pattern aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    /// Instance count at which agreement stops discounting the score.
    pub min_instances_target: usize,

    /// Maximum suggestions returned per query.
    pub suggestion_limit: usize,

    /// Promotion bars.
    pub promotion: PromotionPolicy,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            min_instances_target: 3,
            suggestion_limit: 10,
            promotion: PromotionPolicy::default(),
        }
    }
}
