//! Change lifecycle types
//!
//! A [`ProposedChange`] is the unit of governance: a modification one fleet
//! instance wants applied fleet-wide. Its [`ChangeStatus`] walks a fixed
//! state machine from registration through approval or consensus to a
//! terminal outcome.

use crate::error::GovernanceError;
use crate::ids::{ChangeId, InstanceId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Open-vocabulary category of a change (e.g. "prompt_template", "tool_config")
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeType(String);

impl ChangeType {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Self-reported risk level of a change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// How far the effects of a change reach
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlastRadius {
    /// Only the proposing instance is affected.
    SingleInstance,
    /// A cohort of instances is affected.
    Cohort,
    /// The whole fleet is affected.
    Fleet,
}

/// How a change can be undone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reversibility {
    /// Rollback is mechanical and needs no operator involvement.
    Automatic,
    /// Rollback requires operator action.
    Manual,
    /// The change cannot be undone once applied.
    Irreversible,
}

/// Risk metadata the proposing instance attaches to a change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskMetadata {
    /// Self-assessed risk level
    pub risk_level: RiskLevel,

    /// Expected blast radius if the change misbehaves
    pub blast_radius: BlastRadius,

    /// Whether the change can be rolled back automatically
    pub reversibility: Reversibility,

    /// Fraction of the changed behavior covered by tests (0.0 to 1.0)
    pub test_coverage: f64,
}

impl RiskMetadata {
    /// Checks the metadata for internal consistency.
    pub fn validate(&self) -> Result<(), GovernanceError> {
        if !(0.0..=1.0).contains(&self.test_coverage) {
            return Err(GovernanceError::Validation(format!(
                "test_coverage must be within [0.0, 1.0], got {}",
                self.test_coverage
            )));
        }
        Ok(())
    }
}

/// Lifecycle status of a proposed change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeStatus {
    /// Registered with the safety monitor, no metrics seen yet.
    Registered,
    /// Live metrics are being collected for the trial run.
    Monitoring,
    /// Approved without a vote based on similarity to stable history.
    AutoApproved,
    /// A consensus proposal is open and collecting votes.
    Voting,
    /// Approved by fleet consensus.
    Approved,
    /// Rejected by consensus, veto, or voting timeout.
    Rejected,
    /// Broadcast to the fleet, stability window running.
    Applying,
    /// Survived the stability window; part of the accepted corpus.
    Stable,
    /// Rolled back after a critical metric breach.
    RolledBack,
}

impl ChangeStatus {
    /// Terminal statuses accept no further transitions, apart from the
    /// post-stabilization grace window in which `Stable` may still roll back.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChangeStatus::Rejected | ChangeStatus::Stable | ChangeStatus::RolledBack
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeStatus::Registered => "registered",
            ChangeStatus::Monitoring => "monitoring",
            ChangeStatus::AutoApproved => "auto_approved",
            ChangeStatus::Voting => "voting",
            ChangeStatus::Approved => "approved",
            ChangeStatus::Rejected => "rejected",
            ChangeStatus::Applying => "applying",
            ChangeStatus::Stable => "stable",
            ChangeStatus::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A modification one instance proposes for fleet-wide adoption
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedChange {
    /// Caller-supplied identifier, unique across the fleet
    pub id: ChangeId,

    /// Instance that proposed the change
    pub instance_id: InstanceId,

    /// Category used for similarity lookup and pattern grouping
    pub change_type: ChangeType,

    /// Opaque change content, broadcast verbatim on approval
    pub payload: serde_json::Value,

    /// Risk metadata attached at registration
    pub risk: RiskMetadata,

    /// Current lifecycle status
    pub status: ChangeStatus,

    /// Registration time
    pub created_at: chrono::DateTime<chrono::Utc>,

    /// Time of the most recent status transition
    pub status_changed_at: chrono::DateTime<chrono::Utc>,

    /// Set when the change reached `Stable`; anchors the grace window
    pub stabilized_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl ProposedChange {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
