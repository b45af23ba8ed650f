//! Cross-instance pattern aggregation.
//!
//! Instances report the approaches that work for them; the aggregator
//! merges reports into fleet-level patterns:
//!
//! - [`PatternAggregator::record_pattern`] merges one observation and
//!   announces the discovery.
//! - [`PatternAggregator::suggest_pattern`] ranks known patterns against
//!   a query context.
//! - [`PatternAggregator::get_consensus_patterns`] filters by agreement.
//! - [`PatternAggregator::aggregate_learnings`] promotes proven patterns
//!   to fleet-wide defaults.
//!
//! Reports deduplicate under a [`PatternKeyer`]; the default keys by the
//! payload's `name`/`template` field and falls back to a content hash.

#![deny(unsafe_code)]

pub mod aggregator;
pub mod config;
pub mod keyer;

pub use aggregator::{PatternAggregator, PatternSuggestion};
pub use config::{PatternConfig, PromotionPolicy};
pub use keyer::{PatternKeyer, PayloadKeyer};
