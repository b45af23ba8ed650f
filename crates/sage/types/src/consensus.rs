//! Consensus proposals and votes

use crate::ids::{ChangeId, InstanceId, ProposalId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Evidence the proposer attaches to a consensus proposal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalMetadata {
    /// Expected relative improvement from adopting the change
    pub expected_improvement: f64,

    /// Blast radius if the change misbehaves
    pub blast_radius: crate::change::BlastRadius,

    /// Estimated time to roll the change back, in seconds
    pub rollback_time_secs: u64,

    /// Trial results gathered on the proposing instance
    pub trial_results: serde_json::Value,
}

/// Lifecycle status of a consensus proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalStatus {
    /// Open and collecting votes.
    Voting,
    /// Quorum approved the change.
    Approved,
    /// Quorum or a strong rejection vetoed the change.
    Rejected,
    /// The voting window elapsed without a decision.
    TimedOut,
}

impl ProposalStatus {
    pub fn is_decided(&self) -> bool {
        !matches!(self, ProposalStatus::Voting)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Voting => "voting",
            ProposalStatus::Approved => "approved",
            ProposalStatus::Rejected => "rejected",
            ProposalStatus::TimedOut => "timed_out",
        }
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request for fleet-wide agreement on one change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusProposal {
    /// Proposal identifier minted at creation
    pub id: ProposalId,

    /// The change being voted on; at most one open proposal per change
    pub change_id: ChangeId,

    /// Instance that opened the proposal
    pub proposer: InstanceId,

    /// Change content, broadcast verbatim if consensus approves
    pub payload: serde_json::Value,

    /// Proposer-supplied evidence
    pub metadata: ProposalMetadata,

    /// Current status
    pub status: ProposalStatus,

    /// When voting opened
    pub created_at: chrono::DateTime<chrono::Utc>,

    /// When the proposal left `Voting`, if it has
    pub decided_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl ConsensusProposal {
    pub fn is_decided(&self) -> bool {
        self.status.is_decided()
    }
}

/// Direction of a vote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteDecision {
    Approve,
    Reject,
}

/// One instance's vote on a proposal
///
/// Votes are unique per (proposal, instance); a revote replaces the
/// earlier ballot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    /// Proposal being voted on
    pub proposal_id: ProposalId,

    /// Voting instance
    pub instance_id: InstanceId,

    /// Approve or reject
    pub decision: VoteDecision,

    /// Voter confidence in its decision (0.0 to 1.0)
    pub confidence: f64,

    /// Free-form rationale
    pub reason: String,

    /// When the vote was cast
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Vote {
    pub fn is_approve(&self) -> bool {
        matches!(self.decision, VoteDecision::Approve)
    }
}
