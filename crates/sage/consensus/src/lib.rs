//! Fleet consensus for changes that need a vote.
//!
//! Changes the safety monitor declines to auto-approve go through a
//! quorum vote:
//!
//! - [`ConsensusEngine::propose_change`] opens the vote and broadcasts a
//!   voting request to the fleet.
//! - [`ConsensusEngine::vote_on_change`] records ballots; the deciding
//!   ballot executes the outcome.
//! - [`ConsensusEngine::execute_if_consensus`] re-drives execution after
//!   a crash; it never broadcasts twice.
//! - [`ConsensusEngine::expire_overdue`] rejects proposals whose voting
//!   window elapsed, so an inattentive fleet fails safe.
//!
//! Quorum rules live in [`QuorumPolicy`], kept pure so the store can run
//! them inside the transaction that records each ballot.

#![deny(unsafe_code)]

pub mod config;
pub mod engine;
pub mod quorum;

pub use config::ConsensusConfig;
pub use engine::{ConsensusEngine, ExecutionOutcome, VoteOutcome};
pub use quorum::{QuorumOutcome, QuorumPolicy};
