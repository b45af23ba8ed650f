//! Cross-instance learned patterns

use crate::ids::{InstanceId, PatternId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Open-vocabulary category of a pattern (e.g. "retry_strategy", "prompt_structure")
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PatternType(String);

impl PatternType {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A recurring approach observed across fleet instances
///
/// Reports with the same (type, canonical key) merge into one pattern.
/// `consensus_score` blends the mean per-instance success rate with how
/// many distinct instances have observed the pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    /// Identifier minted on first report
    pub id: PatternId,

    /// Pattern category
    pub pattern_type: PatternType,

    /// Deduplication key derived from the payload
    pub canonical_key: String,

    /// Latest reported payload for this pattern
    pub payload: serde_json::Value,

    /// Instances that have reported the pattern
    pub source_instances: BTreeSet<InstanceId>,

    /// Most recent success rate per reporting instance
    pub per_instance_success_rate: BTreeMap<InstanceId, f64>,

    /// Agreement score (0.0 to 1.0)
    pub consensus_score: f64,

    /// Total number of reports
    pub usage_count: u64,

    /// Set once the pattern is promoted fleet-wide; never unset
    pub promoted: bool,

    /// First report time
    pub created_at: chrono::DateTime<chrono::Utc>,

    /// Most recent report or promotion time
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Pattern {
    pub fn instance_count(&self) -> usize {
        self.source_instances.len()
    }

    /// Mean of the per-instance success rates, 0.0 when no reports exist.
    pub fn mean_success_rate(&self) -> f64 {
        if self.per_instance_success_rate.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.per_instance_success_rate.values().sum();
        sum / self.per_instance_success_rate.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_pattern() -> Pattern {
        Pattern {
            id: PatternId::generate(),
            pattern_type: PatternType::new("retry_strategy"),
            canonical_key: "backoff-jitter".into(),
            payload: serde_json::json!({"name": "backoff-jitter"}),
            source_instances: BTreeSet::new(),
            per_instance_success_rate: BTreeMap::new(),
            consensus_score: 0.0,
            usage_count: 0,
            promoted: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn mean_success_rate_of_empty_pattern_is_zero() {
        assert_eq!(sample_pattern().mean_success_rate(), 0.0);
    }

    #[test]
    fn mean_success_rate_averages_instances() {
        let mut pattern = sample_pattern();
        pattern
            .per_instance_success_rate
            .insert(InstanceId::new("a"), 0.8);
        pattern
            .per_instance_success_rate
            .insert(InstanceId::new("b"), 1.0);
        assert!((pattern.mean_success_rate() - 0.9).abs() < 1e-9);
    }
}
