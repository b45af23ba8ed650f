//! In-process facade over the SAGE governance engines.
//!
//! [`GovernanceService`] wires the safety monitor, the consensus engine
//! and the pattern aggregator to one shared store and bus, and adds what
//! no single engine owns:
//!
//! - the stability-watch handoff after a consensus approval,
//! - periodic sweeps for overdue proposals and elapsed stability windows,
//! - a daily pattern promotion pass.
//!
//! Construct it with [`GovernanceService::new`], call the engine methods
//! directly, and run [`GovernanceService::start`] on an [`Arc`] of the
//! service to drive the background jobs.
//!
//! [`Arc`]: std::sync::Arc

#![deny(unsafe_code)]

pub mod config;
pub mod service;

pub use config::GovernanceConfig;
pub use service::GovernanceService;
