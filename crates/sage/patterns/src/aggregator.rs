//! The pattern aggregator
//!
//! Collects per-instance pattern reports, merges them by canonical key,
//! scores cross-instance agreement, and promotes proven patterns to
//! fleet-wide defaults. Merging and rescoring run inside the store's
//! transaction, so concurrent reports never lose an instance's rate.

use std::sync::Arc;

use sage_bus::{BusMessage, GovernanceBus};
use sage_similarity::SimilarityStrategy;
use sage_store::{GovernanceStore, PatternReport, PatternStore};
use sage_types::{GovernanceError, GovernanceResult, InstanceId, Pattern, PatternId, PatternType};
use tracing::{debug, info, instrument};

use crate::config::PatternConfig;
use crate::keyer::{PatternKeyer, PayloadKeyer};

/// One ranked match for a query context.
#[derive(Debug, Clone)]
pub struct PatternSuggestion {
    pub pattern: Pattern,
    /// Similarity between the query context and the pattern payload.
    pub similarity: f64,
    /// Mean per-instance success rate at suggestion time.
    pub success_rate: f64,
}

/// Aggregates what individual instances learned into fleet knowledge.
pub struct PatternAggregator {
    store: Arc<dyn GovernanceStore>,
    bus: Arc<dyn GovernanceBus>,
    similarity: Arc<dyn SimilarityStrategy>,
    keyer: Arc<dyn PatternKeyer>,
    config: PatternConfig,
}

impl PatternAggregator {
    pub fn new(
        store: Arc<dyn GovernanceStore>,
        bus: Arc<dyn GovernanceBus>,
        similarity: Arc<dyn SimilarityStrategy>,
        config: PatternConfig,
    ) -> Self {
        Self {
            store,
            bus,
            similarity,
            keyer: Arc::new(PayloadKeyer),
            config,
        }
    }

    /// Replaces the canonical key derivation.
    pub fn with_keyer(mut self, keyer: Arc<dyn PatternKeyer>) -> Self {
        self.keyer = keyer;
        self
    }

    /// Records one instance's observation of a pattern and announces the
    /// merged result to the fleet.
    #[instrument(skip(self, payload))]
    pub async fn record_pattern(
        &self,
        instance_id: InstanceId,
        pattern_type: PatternType,
        payload: serde_json::Value,
        success_rate: f64,
    ) -> GovernanceResult<PatternId> {
        if !(0.0..=1.0).contains(&success_rate) {
            return Err(GovernanceError::Validation(format!(
                "success_rate must be within 0.0..=1.0, got {success_rate}"
            )));
        }

        let report = PatternReport {
            instance_id,
            pattern_type,
            canonical_key: self.keyer.canonical_key(&payload),
            payload,
            success_rate,
        };

        let target = self.config.min_instances_target;
        let rescore = move |pattern: &Pattern| consensus_score(pattern, target);
        let merged = self.store.upsert_pattern(report, &rescore).await?;

        debug!(
            pattern_id = %merged.id,
            pattern_type = %merged.pattern_type,
            canonical_key = %merged.canonical_key,
            instances = merged.instance_count(),
            score = merged.consensus_score,
            "pattern report merged"
        );
        self.bus
            .publish(BusMessage::PatternDiscovery {
                pattern_id: merged.id.clone(),
                pattern_type: merged.pattern_type.clone(),
                canonical_key: merged.canonical_key.clone(),
                consensus_score: merged.consensus_score,
            })
            .await?;
        Ok(merged.id)
    }

    /// Ranks known patterns of a type against a query context.
    ///
    /// The ranking weight is similarity to the context times observed
    /// success; the list is truncated to the configured limit.
    #[instrument(skip(self, context))]
    pub async fn suggest_pattern(
        &self,
        pattern_type: &PatternType,
        context: &serde_json::Value,
    ) -> GovernanceResult<Vec<PatternSuggestion>> {
        let patterns = self.store.list_patterns(Some(pattern_type)).await?;

        let mut suggestions: Vec<PatternSuggestion> = patterns
            .into_iter()
            .map(|pattern| {
                let similarity = self.similarity.score(context, &pattern.payload);
                let success_rate = pattern.mean_success_rate();
                PatternSuggestion {
                    pattern,
                    similarity,
                    success_rate,
                }
            })
            .collect();

        suggestions.sort_by(|a, b| {
            (b.similarity * b.success_rate).total_cmp(&(a.similarity * a.success_rate))
        });
        suggestions.truncate(self.config.suggestion_limit);
        Ok(suggestions)
    }

    /// Patterns of a type whose agreement clears the caller's bar,
    /// strongest first.
    pub async fn get_consensus_patterns(
        &self,
        pattern_type: &PatternType,
        threshold: f64,
        min_instances: usize,
    ) -> GovernanceResult<Vec<Pattern>> {
        let mut patterns: Vec<Pattern> = self
            .store
            .list_patterns(Some(pattern_type))
            .await?
            .into_iter()
            .filter(|pattern| {
                pattern.consensus_score >= threshold && pattern.instance_count() >= min_instances
            })
            .collect();
        patterns.sort_by(|a, b| b.consensus_score.total_cmp(&a.consensus_score));
        Ok(patterns)
    }

    /// Promotes every pattern that has proven itself across the fleet and
    /// returns how many this run promoted.
    ///
    /// The promoted flag is flipped by the store, so re-runs never
    /// re-promote or double-announce.
    #[instrument(skip(self))]
    pub async fn aggregate_learnings(&self) -> GovernanceResult<usize> {
        let policy = self.config.promotion.clone();
        let qualifies = move |pattern: &Pattern| {
            pattern.consensus_score >= policy.min_consensus_score
                && pattern.mean_success_rate() >= policy.min_success_rate
                && pattern.instance_count() >= policy.min_instances
                && pattern.usage_count >= policy.min_usage
        };
        let promoted = self.store.promote_if(&qualifies).await?;

        for pattern in &promoted {
            info!(
                pattern_id = %pattern.id,
                pattern_type = %pattern.pattern_type,
                canonical_key = %pattern.canonical_key,
                score = pattern.consensus_score,
                "pattern promoted fleet-wide"
            );
            self.bus
                .publish(BusMessage::PatternPromotion {
                    pattern_id: pattern.id.clone(),
                    pattern_type: pattern.pattern_type.clone(),
                    canonical_key: pattern.canonical_key.clone(),
                    consensus_score: pattern.consensus_score,
                })
                .await?;
        }
        Ok(promoted.len())
    }
}

/// Mean per-instance success rate, discounted until enough distinct
/// instances have reported.
fn consensus_score(pattern: &Pattern, min_instances_target: usize) -> f64 {
    if min_instances_target == 0 {
        return pattern.mean_success_rate();
    }
    let agreement = (pattern.instance_count() as f64 / min_instances_target as f64).min(1.0);
    pattern.mean_success_rate() * agreement
}
