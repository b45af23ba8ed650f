//! Topics and message payloads

use sage_types::{
    ChangeId, InstanceId, MetricKind, PatternId, PatternType, ProposalId, ProposalMetadata,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The fixed topic set governance traffic travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// New proposals instances should vote on.
    VotingRequests,
    /// Approved change payloads and rejection notices.
    ApprovedChanges,
    /// Orders to revert a rolled-back change.
    RollbackCommands,
    /// Newly observed or re-observed patterns.
    PatternDiscoveries,
    /// Patterns promoted to fleet-wide defaults.
    PatternPromotions,
}

impl Topic {
    pub const ALL: [Topic; 5] = [
        Topic::VotingRequests,
        Topic::ApprovedChanges,
        Topic::RollbackCommands,
        Topic::PatternDiscoveries,
        Topic::PatternPromotions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::VotingRequests => "voting_requests",
            Topic::ApprovedChanges => "approved_changes",
            Topic::RollbackCommands => "rollback_commands",
            Topic::PatternDiscoveries => "pattern_discoveries",
            Topic::PatternPromotions => "pattern_promotions",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Topic::VotingRequests => 0,
            Topic::ApprovedChanges => 1,
            Topic::RollbackCommands => 2,
            Topic::PatternDiscoveries => 3,
            Topic::PatternPromotions => 4,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged governance messages; each variant routes to one topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BusMessage {
    /// A proposal opened for voting.
    VotingRequest {
        proposal_id: ProposalId,
        change_id: ChangeId,
        proposer: InstanceId,
        metadata: ProposalMetadata,
    },
    /// A change was approved; instances apply the payload.
    ChangeApproved {
        change_id: ChangeId,
        payload: serde_json::Value,
    },
    /// A change was rejected; no payload travels.
    ChangeRejected { change_id: ChangeId },
    /// A rolled-back change must be reverted on every instance.
    RollbackCommand {
        change_id: ChangeId,
        metric: MetricKind,
        threshold: f64,
        observed_value: f64,
    },
    /// A pattern report was recorded.
    PatternDiscovery {
        pattern_id: PatternId,
        pattern_type: PatternType,
        canonical_key: String,
        consensus_score: f64,
    },
    /// A pattern crossed the promotion bar.
    PatternPromotion {
        pattern_id: PatternId,
        pattern_type: PatternType,
        canonical_key: String,
        consensus_score: f64,
    },
}

impl BusMessage {
    /// The topic this message routes to.
    pub fn topic(&self) -> Topic {
        match self {
            BusMessage::VotingRequest { .. } => Topic::VotingRequests,
            BusMessage::ChangeApproved { .. } | BusMessage::ChangeRejected { .. } => {
                Topic::ApprovedChanges
            }
            BusMessage::RollbackCommand { .. } => Topic::RollbackCommands,
            BusMessage::PatternDiscovery { .. } => Topic::PatternDiscoveries,
            BusMessage::PatternPromotion { .. } => Topic::PatternPromotions,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BusMessage::VotingRequest { .. } => "voting_request",
            BusMessage::ChangeApproved { .. } => "change_approved",
            BusMessage::ChangeRejected { .. } => "change_rejected",
            BusMessage::RollbackCommand { .. } => "rollback_command",
            BusMessage::PatternDiscovery { .. } => "pattern_discovery",
            BusMessage::PatternPromotion { .. } => "pattern_promotion",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approval_and_rejection_share_a_topic() {
        let approved = BusMessage::ChangeApproved {
            change_id: ChangeId::new("c1"),
            payload: serde_json::json!({"template": "v2"}),
        };
        let rejected = BusMessage::ChangeRejected {
            change_id: ChangeId::new("c2"),
        };
        assert_eq!(approved.topic(), Topic::ApprovedChanges);
        assert_eq!(rejected.topic(), Topic::ApprovedChanges);
    }

    #[test]
    fn topic_indices_cover_all_topics() {
        let mut seen = [false; Topic::ALL.len()];
        for topic in Topic::ALL {
            seen[topic.index()] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn message_serialization_roundtrip() {
        let msg = BusMessage::RollbackCommand {
            change_id: ChangeId::new("c1"),
            metric: MetricKind::ErrorRate,
            threshold: 0.10,
            observed_value: 0.34,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: BusMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }
}
