//! Safety monitoring for fleet change governance.
//!
//! The safety monitor is the first gate a proposed change passes:
//!
//! - [`SafetyMonitor::register_change`] records the change and its risk
//!   metadata.
//! - [`SafetyMonitor::report_metrics`] ingests trial metrics and rolls the
//!   change back after a sustained critical threshold breach.
//! - [`SafetyMonitor::evaluate_approval`] lets low-risk changes that
//!   resemble already stabilized ones skip fleet consensus.
//! - [`SafetyMonitor::confirm_stability`] promotes a change that applied
//!   cleanly through the stability window.

#![deny(unsafe_code)]

pub mod config;
pub mod monitor;
pub mod thresholds;

pub use config::{ApprovalPolicy, SafetyConfig};
pub use monitor::{
    ApprovalAssessment, ApprovalDecision, MetricOutcome, SafetyMonitor, StabilityOutcome,
};
pub use thresholds::MetricThresholds;
