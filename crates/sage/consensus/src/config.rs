//! Consensus engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Quorum arithmetic and voting-window settings.
///
/// Approve shares in `reject_ratio..approve_ratio` keep the vote open;
/// the band gives a contested proposal time to gather more ballots
/// before the timeout rejects it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Ballots required before quorum arithmetic applies.
    pub min_voters: usize,

    /// Approve share required to pass.
    pub approve_ratio: f64,

    /// Approve share below which a quorum rejects outright.
    pub reject_ratio: f64,

    /// Mean confidence across all ballots required to pass.
    pub min_avg_confidence: f64,

    /// A rejection above this confidence vetoes the proposal on its own.
    pub strong_rejection_confidence: f64,

    /// Proposals still voting after this long time out and are rejected.
    pub voting_timeout: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            min_voters: 3,
            approve_ratio: 2.0 / 3.0,
            reject_ratio: 1.0 / 3.0,
            min_avg_confidence: 0.85,
            strong_rejection_confidence: 0.90,
            voting_timeout: Duration::from_secs(60 * 60),
        }
    }
}
