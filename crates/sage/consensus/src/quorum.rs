//! Quorum arithmetic over a proposal's ballot set.
//!
//! [`QuorumPolicy::evaluate`] is pure: the engine hands it to the store
//! as the vote decider so the verdict is always computed against the
//! ballot set it is persisted with.

use sage_types::{ProposalStatus, Vote, VoteDecision};

use crate::config::ConsensusConfig;

/// Verdict over the current ballot set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumOutcome {
    /// A single strong rejection ended the proposal.
    Vetoed,
    /// Quorum present with enough approvals and confidence.
    Approved,
    /// Quorum present and the approve share fell below the floor.
    Rejected,
    /// Keep collecting ballots.
    Pending,
}

impl QuorumOutcome {
    /// The proposal status a decided outcome maps to; `None` keeps the
    /// vote open.
    pub fn status(self) -> Option<ProposalStatus> {
        match self {
            QuorumOutcome::Approved => Some(ProposalStatus::Approved),
            QuorumOutcome::Vetoed | QuorumOutcome::Rejected => Some(ProposalStatus::Rejected),
            QuorumOutcome::Pending => None,
        }
    }
}

/// The quorum rules, applied in order: veto, then approval, then the
/// rejection floor. Assumes one ballot per instance.
#[derive(Debug, Clone)]
pub struct QuorumPolicy {
    config: ConsensusConfig,
}

impl QuorumPolicy {
    pub fn new(config: ConsensusConfig) -> Self {
        Self { config }
    }

    /// Evaluates the ballot set.
    ///
    /// The veto applies even below quorum: one instance rejecting with
    /// very high confidence is treated as having watched the change fail.
    pub fn evaluate(&self, votes: &[Vote]) -> QuorumOutcome {
        if votes.iter().any(|vote| self.is_strong_rejection(vote)) {
            return QuorumOutcome::Vetoed;
        }

        let total = votes.len();
        if total < self.config.min_voters {
            return QuorumOutcome::Pending;
        }

        let approvals = votes.iter().filter(|vote| vote.is_approve()).count();
        let approve_share = approvals as f64 / total as f64;
        let avg_confidence = votes.iter().map(|vote| vote.confidence).sum::<f64>() / total as f64;

        if approve_share >= self.config.approve_ratio
            && avg_confidence >= self.config.min_avg_confidence
        {
            QuorumOutcome::Approved
        } else if approve_share < self.config.reject_ratio {
            QuorumOutcome::Rejected
        } else {
            QuorumOutcome::Pending
        }
    }

    fn is_strong_rejection(&self, vote: &Vote) -> bool {
        vote.decision == VoteDecision::Reject
            && vote.confidence > self.config.strong_rejection_confidence
    }
}
