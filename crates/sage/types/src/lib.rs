//! Shared types for the SAGE change-governance layer.
//!
//! This crate provides:
//! - **Identifiers** for governed entities ([`ChangeId`], [`InstanceId`], [`ProposalId`], [`PatternId`]).
//! - **Change lifecycle types** ([`ProposedChange`], [`ChangeStatus`], [`RiskMetadata`]).
//! - **Metric and rollback types** ([`MetricSample`], [`RollbackEvent`], [`BreachRecord`]).
//! - **Consensus types** ([`ConsensusProposal`], [`Vote`], [`ProposalStatus`]).
//! - **Pattern types** ([`Pattern`], [`PatternType`]).
//! - **Error taxonomy** shared by every SAGE crate ([`GovernanceError`], [`StoreError`], [`BusError`]).

#![deny(unsafe_code)]

pub mod change;
pub mod consensus;
pub mod error;
pub mod ids;
pub mod metrics;
pub mod pattern;

// Re-exports for convenience.
pub use change::{
    BlastRadius, ChangeStatus, ChangeType, ProposedChange, Reversibility, RiskLevel, RiskMetadata,
};
pub use consensus::{ConsensusProposal, ProposalMetadata, ProposalStatus, Vote, VoteDecision};
pub use error::{
    BusError, BusResult, GovernanceError, GovernanceResult, StoreError, StoreResult,
};
pub use ids::{ChangeId, InstanceId, PatternId, ProposalId};
pub use metrics::{
    BreachRecord, BreachSeverity, MetricKind, MetricReading, MetricSample, RollbackEvent,
};
pub use pattern::{Pattern, PatternType};
