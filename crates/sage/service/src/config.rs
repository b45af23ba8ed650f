//! Service configuration.

use std::time::Duration;

use sage_consensus::ConsensusConfig;
use sage_patterns::PatternConfig;
use sage_safety::SafetyConfig;
use serde::{Deserialize, Serialize};

/// Top-level configuration for the governance service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceConfig {
    /// Safety monitor settings.
    pub safety: SafetyConfig,

    /// Consensus engine settings.
    pub consensus: ConsensusConfig,

    /// Pattern aggregator settings.
    pub patterns: PatternConfig,

    /// How often the proposal timeout and stability sweeps run.
    pub sweep_interval: Duration,

    /// How often the pattern aggregation job runs.
    pub aggregation_interval: Duration,

    /// Background retry attempts for a failed broadcast.
    pub publish_retries: u32,

    /// Delay before the first broadcast retry; doubles per attempt.
    pub publish_backoff: Duration,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            safety: SafetyConfig::default(),
            consensus: ConsensusConfig::default(),
            patterns: PatternConfig::default(),
            sweep_interval: Duration::from_secs(30),
            aggregation_interval: Duration::from_secs(24 * 60 * 60),
            publish_retries: 3,
            publish_backoff: Duration::from_millis(500),
        }
    }
}
