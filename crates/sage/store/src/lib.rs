//! Durable storage for the SAGE governance layer.
//!
//! The store is the single coordination point for the fleet: every
//! aggregate-dependent decision (quorum evaluation, threshold rollback,
//! pattern promotion) re-reads its aggregate inside the same transaction
//! that writes the outcome. The trait family keeps that contract explicit
//! by taking the deciding closure as an argument, so both backends run it
//! under their transaction.
//!
//! Two implementations are provided: [`MemoryStore`] for tests and single
//! process deployments, and [`PostgresStore`] for shared durable state.

#![deny(unsafe_code)]

pub mod memory;
pub mod postgres;
pub mod traits;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use traits::{
    ChangeStore, ChangeTransition, GovernanceStore, IngestOutcome, MetricStore, PatternReport,
    PatternStore, ProposalStore, RollbackExecution, SampleDecision, SampleWindow, VoteRecorded,
};
