//! Safety monitor configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::thresholds::MetricThresholds;

/// Gates a change must clear to skip fleet consensus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalPolicy {
    /// Minimum similarity to a previously stabilized change of the same type.
    pub min_similarity: f64,

    /// Minimum declared test coverage.
    pub min_test_coverage: f64,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            min_similarity: 0.85,
            min_test_coverage: 0.90,
        }
    }
}

/// Configuration for the safety monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Metric thresholds for breach detection.
    pub thresholds: MetricThresholds,

    /// Consecutive critical samples required before automatic rollback.
    pub min_breach_samples: usize,

    /// Maximum samples retained per change.
    pub max_window_samples: usize,

    /// Samples older than this fall out of the window.
    pub max_sample_age: Duration,

    /// How long a change must apply cleanly before it is confirmed stable.
    pub stability_window: Duration,

    /// How long after stabilization metrics may still revoke a change.
    pub stabilization_grace: Duration,

    /// Auto-approval gates.
    pub approval: ApprovalPolicy,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            thresholds: MetricThresholds::default(),
            min_breach_samples: 3,
            max_window_samples: 200,
            max_sample_age: Duration::from_secs(24 * 60 * 60),
            stability_window: Duration::from_secs(30 * 60),
            stabilization_grace: Duration::from_secs(10 * 60),
            approval: ApprovalPolicy::default(),
        }
    }
}
