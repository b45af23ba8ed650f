//! The governance service
//!
//! One facade over the three engines, sharing a store, a bus and a
//! similarity strategy. The service owns the glue the engines keep out
//! of each other: when consensus approves a change, the safety monitor's
//! stability watch takes over. Background sweeps cover whatever a
//! restart dropped, so no proposal waits forever and no applying change
//! is left without a stability check.

use std::sync::Arc;

use chrono::Utc;
use sage_bus::{GovernanceBus, RetryingPublisher};
use sage_consensus::{ConsensusEngine, ExecutionOutcome, VoteOutcome};
use sage_patterns::{PatternAggregator, PatternSuggestion};
use sage_safety::{ApprovalAssessment, MetricOutcome, SafetyMonitor, StabilityOutcome};
use sage_similarity::SimilarityStrategy;
use sage_store::{ChangeStore, GovernanceStore};
use sage_types::{
    BreachRecord, ChangeId, ChangeStatus, ChangeType, GovernanceResult, InstanceId, MetricReading,
    Pattern, PatternId, PatternType, ProposalId, ProposalMetadata, ProposalStatus, RiskMetadata,
    RollbackEvent, VoteDecision,
};
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::config::GovernanceConfig;

/// The in-process API surface of the governance layer.
pub struct GovernanceService {
    store: Arc<dyn GovernanceStore>,
    safety: SafetyMonitor,
    consensus: ConsensusEngine,
    patterns: PatternAggregator,
    config: GovernanceConfig,
    running: Arc<RwLock<bool>>,
}

impl GovernanceService {
    pub fn new(
        store: Arc<dyn GovernanceStore>,
        bus: Arc<dyn GovernanceBus>,
        similarity: Arc<dyn SimilarityStrategy>,
        config: GovernanceConfig,
    ) -> Self {
        // Decisions are durable before anything is published, so broker
        // hiccups retry in the background instead of failing the call.
        let bus: Arc<dyn GovernanceBus> = Arc::new(RetryingPublisher::new(
            bus,
            config.publish_retries,
            config.publish_backoff,
        ));
        let safety = SafetyMonitor::new(
            store.clone(),
            bus.clone(),
            similarity.clone(),
            config.safety.clone(),
        );
        let consensus = ConsensusEngine::new(store.clone(), bus.clone(), config.consensus.clone());
        let patterns = PatternAggregator::new(store.clone(), bus, similarity, config.patterns.clone());

        Self {
            store,
            safety,
            consensus,
            patterns,
            config,
            running: Arc::new(RwLock::new(false)),
        }
    }

    // Safety monitor surface.

    pub async fn register_change(
        &self,
        instance_id: InstanceId,
        change_id: ChangeId,
        change_type: ChangeType,
        payload: serde_json::Value,
        risk: RiskMetadata,
    ) -> GovernanceResult<ChangeId> {
        self.safety
            .register_change(instance_id, change_id, change_type, payload, risk)
            .await
    }

    pub async fn report_metrics(
        &self,
        instance_id: InstanceId,
        change_id: ChangeId,
        reading: MetricReading,
    ) -> GovernanceResult<MetricOutcome> {
        self.safety
            .report_metrics(instance_id, change_id, reading)
            .await
    }

    pub async fn evaluate_approval(
        &self,
        change_id: &ChangeId,
    ) -> GovernanceResult<ApprovalAssessment> {
        self.safety.evaluate_approval(change_id).await
    }

    pub async fn rollback(
        &self,
        change_id: &ChangeId,
        cause: BreachRecord,
    ) -> GovernanceResult<RollbackEvent> {
        self.safety.rollback(change_id, cause).await
    }

    pub async fn confirm_stability(
        &self,
        change_id: &ChangeId,
    ) -> GovernanceResult<StabilityOutcome> {
        self.safety.confirm_stability(change_id).await
    }

    // Consensus surface.

    pub async fn propose_change(
        &self,
        instance_id: InstanceId,
        change_id: ChangeId,
        payload: serde_json::Value,
        metadata: ProposalMetadata,
    ) -> GovernanceResult<ProposalId> {
        self.consensus
            .propose_change(instance_id, change_id, payload, metadata)
            .await
    }

    /// Records a ballot. When the ballot approves the change, the
    /// stability watch starts so the change can graduate on schedule.
    pub async fn vote_on_change(
        &self,
        instance_id: InstanceId,
        change_id: ChangeId,
        decision: VoteDecision,
        confidence: f64,
        reason: impl Into<String>,
    ) -> GovernanceResult<VoteOutcome> {
        let outcome = self
            .consensus
            .vote_on_change(instance_id, change_id.clone(), decision, confidence, reason)
            .await?;

        if matches!(
            outcome,
            VoteOutcome::ConsensusReached {
                status: ProposalStatus::Approved
            }
        ) {
            self.safety.begin_stability_watch(change_id);
        }
        Ok(outcome)
    }

    /// Re-drives execution of a decided proposal, restarting the
    /// stability watch when the change is (still) applying.
    pub async fn execute_if_consensus(
        &self,
        proposal_id: &ProposalId,
    ) -> GovernanceResult<ExecutionOutcome> {
        let outcome = self.consensus.execute_if_consensus(proposal_id).await?;
        if let ExecutionOutcome::Applied(change) = &outcome {
            self.safety.begin_stability_watch(change.id.clone());
        }
        Ok(outcome)
    }

    // Pattern surface.

    pub async fn record_pattern(
        &self,
        instance_id: InstanceId,
        pattern_type: PatternType,
        payload: serde_json::Value,
        success_rate: f64,
    ) -> GovernanceResult<PatternId> {
        self.patterns
            .record_pattern(instance_id, pattern_type, payload, success_rate)
            .await
    }

    pub async fn suggest_pattern(
        &self,
        pattern_type: &PatternType,
        context: &serde_json::Value,
    ) -> GovernanceResult<Vec<PatternSuggestion>> {
        self.patterns.suggest_pattern(pattern_type, context).await
    }

    pub async fn get_consensus_patterns(
        &self,
        pattern_type: &PatternType,
        threshold: f64,
        min_instances: usize,
    ) -> GovernanceResult<Vec<Pattern>> {
        self.patterns
            .get_consensus_patterns(pattern_type, threshold, min_instances)
            .await
    }

    pub async fn aggregate_learnings(&self) -> GovernanceResult<usize> {
        self.patterns.aggregate_learnings().await
    }

    // Background jobs.

    /// One pass of the proposal timeout sweep. Normally driven by
    /// [`GovernanceService::start`]; safe to call directly.
    pub async fn sweep_proposals(&self) -> GovernanceResult<usize> {
        let timed_out = self.consensus.expire_overdue(Utc::now()).await?;
        Ok(timed_out.len())
    }

    /// One pass of the stability sweep. Confirms applying changes whose
    /// window elapsed, covering timers lost to a restart.
    pub async fn sweep_stability(&self) -> GovernanceResult<usize> {
        let applying = self
            .store
            .list_changes(Some(ChangeStatus::Applying))
            .await?;

        let mut stabilized = 0;
        for change in applying {
            match self.safety.confirm_stability(&change.id).await {
                Ok(StabilityOutcome::Stabilized(_)) => stabilized += 1,
                Ok(_) => {}
                Err(err) => {
                    warn!(change_id = %change.id, error = %err, "stability check failed");
                }
            }
        }
        Ok(stabilized)
    }

    /// Starts the background sweeps and runs until [`GovernanceService::stop`].
    pub async fn start(self: Arc<Self>) {
        {
            let mut running = self.running.write().await;
            *running = true;
        }
        info!(
            sweep_interval_ms = self.config.sweep_interval.as_millis() as u64,
            aggregation_interval_ms = self.config.aggregation_interval.as_millis() as u64,
            "governance service started"
        );

        let sweeper = self.clone();
        let sweep_handle = tokio::spawn(async move {
            let mut ticker = interval(sweeper.config.sweep_interval);
            loop {
                ticker.tick().await;
                if !*sweeper.running.read().await {
                    break;
                }
                if let Err(err) = sweeper.sweep_proposals().await {
                    error!(error = %err, "proposal sweep failed");
                }
                if let Err(err) = sweeper.sweep_stability().await {
                    error!(error = %err, "stability sweep failed");
                }
            }
        });

        let aggregator = self.clone();
        let aggregation_handle = tokio::spawn(async move {
            let mut ticker = interval(aggregator.config.aggregation_interval);
            loop {
                ticker.tick().await;
                if !*aggregator.running.read().await {
                    break;
                }
                if let Err(err) = aggregator.aggregate_learnings().await {
                    error!(error = %err, "pattern aggregation failed");
                }
            }
        });

        tokio::select! {
            _ = sweep_handle => {}
            _ = aggregation_handle => {}
        }
        info!("governance service stopped");
    }

    /// Signals the background loops to wind down after their current tick.
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
    }
}
