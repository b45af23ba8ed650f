//! The safety monitor
//!
//! Guards the trial phase of a change: collects metrics, enforces the
//! breach thresholds, rolls back on sustained critical breaches, and
//! grants similarity-based auto-approval. Threshold decisions run inside
//! the store transaction that records the sample, so a breach verdict is
//! always computed against the window it is persisted with.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use sage_bus::{BusMessage, GovernanceBus};
use sage_similarity::SimilarityStrategy;
use sage_store::{
    ChangeStore, GovernanceStore, IngestOutcome, MetricStore, SampleDecision, SampleWindow,
};
use sage_types::{
    BreachRecord, ChangeId, ChangeStatus, ChangeType, GovernanceError, GovernanceResult,
    InstanceId, MetricReading, MetricSample, ProposedChange, Reversibility, RiskLevel,
    RiskMetadata, RollbackEvent, StoreError,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::SafetyConfig;

/// Outcome of one metric report.
#[derive(Debug)]
pub enum MetricOutcome {
    /// Sample recorded; the change after any status transition.
    Monitored(ProposedChange),
    /// A sustained critical breach rolled the change back.
    ThresholdBreach(RollbackEvent),
}

/// Whether a change may skip fleet consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    /// Close enough to accepted history to apply without a vote.
    AutoApproved,
    /// Must go through fleet consensus.
    RequiresConsensus,
}

/// Result of evaluating a change for auto-approval.
#[derive(Debug, Clone)]
pub struct ApprovalAssessment {
    pub decision: ApprovalDecision,
    /// Best similarity score against stable changes of the same type.
    pub similarity: f64,
}

/// Result of a stability check.
#[derive(Debug)]
pub enum StabilityOutcome {
    /// The change is confirmed stable.
    Stabilized(ProposedChange),
    /// The stability window has not elapsed yet.
    WindowOpen,
    /// The change is not applying; its current status is returned.
    NotApplying(ChangeStatus),
}

/// Watches trial metrics, enforces thresholds, and grants auto-approval.
pub struct SafetyMonitor {
    store: Arc<dyn GovernanceStore>,
    bus: Arc<dyn GovernanceBus>,
    similarity: Arc<dyn SimilarityStrategy>,
    config: SafetyConfig,
    stability_timers: Arc<DashMap<ChangeId, JoinHandle<()>>>,
}

impl SafetyMonitor {
    pub fn new(
        store: Arc<dyn GovernanceStore>,
        bus: Arc<dyn GovernanceBus>,
        similarity: Arc<dyn SimilarityStrategy>,
        config: SafetyConfig,
    ) -> Self {
        Self {
            store,
            bus,
            similarity,
            config,
            stability_timers: Arc::new(DashMap::new()),
        }
    }

    /// Registers a change for trial monitoring.
    #[instrument(skip(self, payload, risk))]
    pub async fn register_change(
        &self,
        instance_id: InstanceId,
        change_id: ChangeId,
        change_type: ChangeType,
        payload: serde_json::Value,
        risk: RiskMetadata,
    ) -> GovernanceResult<ChangeId> {
        risk.validate()?;

        let now = Utc::now();
        let change = ProposedChange {
            id: change_id.clone(),
            instance_id,
            change_type,
            payload,
            risk,
            status: ChangeStatus::Registered,
            created_at: now,
            status_changed_at: now,
            stabilized_at: None,
        };
        self.store.insert_change(change).await?;

        info!(change_id = %change_id, "change registered");
        Ok(change_id)
    }

    /// Ingests one trial metric sample for a change.
    ///
    /// The first sample moves a registered change into monitoring. A
    /// critical threshold breached by the last `min_breach_samples`
    /// consecutive samples rolls the change back; the append, the breach
    /// records and the rollback are one store transaction. Terminal
    /// changes reject samples, except that a just-stabilized change still
    /// evaluates them during the stabilization grace period.
    #[instrument(skip(self, reading))]
    pub async fn report_metrics(
        &self,
        instance_id: InstanceId,
        change_id: ChangeId,
        reading: MetricReading,
    ) -> GovernanceResult<MetricOutcome> {
        reading.validate()?;

        let window = SampleWindow {
            max_samples: self.config.max_window_samples,
            max_age: to_chrono(self.config.max_sample_age, "max_sample_age")?,
        };
        let grace = to_chrono(self.config.stabilization_grace, "stabilization_grace")?;
        let thresholds = self.config.thresholds.clone();
        let min_breach = self.config.min_breach_samples;

        let evaluate = move |change: &ProposedChange,
                             samples: &[MetricSample]|
              -> Result<SampleDecision, StoreError> {
            let newest = samples
                .last()
                .ok_or_else(|| StoreError::InvalidData("sample window is empty".into()))?;

            match change.status {
                ChangeStatus::Rejected | ChangeStatus::RolledBack => {
                    return Err(StoreError::TerminalState(format!(
                        "change {} is {} and no longer accepts metrics",
                        change.id, change.status
                    )));
                }
                ChangeStatus::Stable => {
                    let in_grace = change
                        .stabilized_at
                        .map(|at| newest.timestamp - at <= grace)
                        .unwrap_or(false);
                    if !in_grace {
                        return Err(StoreError::TerminalState(format!(
                            "change {} is stable and past its revocation window",
                            change.id
                        )));
                    }
                }
                _ => {}
            }

            let breaches = thresholds.violations(newest);
            if let Some(cause) = thresholds.sustained_critical(samples, min_breach) {
                return Ok(SampleDecision::RollBack { breaches, cause });
            }
            let new_status =
                (change.status == ChangeStatus::Registered).then_some(ChangeStatus::Monitoring);
            Ok(SampleDecision::Continue {
                breaches,
                new_status,
            })
        };

        let sample = reading.into_sample(change_id.clone(), instance_id);
        let outcome = self.store.ingest_sample(sample, window, &evaluate).await?;

        match outcome {
            IngestOutcome::Continued(change) => {
                debug!(change_id = %change_id, status = %change.status, "sample recorded");
                Ok(MetricOutcome::Monitored(change))
            }
            IngestOutcome::RolledBack(event) => {
                warn!(
                    change_id = %change_id,
                    metric = %event.metric,
                    observed = event.observed_value,
                    threshold = event.threshold,
                    "sustained critical breach, change rolled back"
                );
                self.cancel_stability_timer(&change_id);
                self.publish_rollback(&event).await?;
                Ok(MetricOutcome::ThresholdBreach(event))
            }
        }
    }

    /// Decides whether a change may apply without a fleet vote.
    ///
    /// Similarity is the best score against payloads of stable changes of
    /// the same type. Auto-approval requires that score to clear the
    /// configured bar on a low or medium risk change that is automatically
    /// reversible and well covered by tests. High risk always goes to
    /// consensus. On auto-approval the change starts applying, the payload
    /// is broadcast, and the stability watch begins.
    #[instrument(skip(self))]
    pub async fn evaluate_approval(
        &self,
        change_id: &ChangeId,
    ) -> GovernanceResult<ApprovalAssessment> {
        let change = self
            .store
            .get_change(change_id)
            .await?
            .ok_or_else(|| GovernanceError::NotFound(format!("change {}", change_id)))?;

        match change.status {
            ChangeStatus::Registered | ChangeStatus::Monitoring => {}
            status if status.is_terminal() => {
                return Err(GovernanceError::TerminalState(format!(
                    "change {} is {}",
                    change_id, status
                )));
            }
            status => {
                return Err(GovernanceError::Conflict(format!(
                    "change {} is already {}",
                    change_id, status
                )));
            }
        }

        let corpus = self
            .store
            .stable_payloads_for_type(&change.change_type)
            .await?;
        let similarity = corpus
            .iter()
            .map(|accepted| self.similarity.score(&change.payload, accepted))
            .fold(0.0_f64, f64::max);

        let eligible = change.risk.risk_level != RiskLevel::High
            && change.risk.reversibility == Reversibility::Automatic
            && change.risk.test_coverage >= self.config.approval.min_test_coverage
            && similarity >= self.config.approval.min_similarity;

        if !eligible {
            info!(change_id = %change_id, similarity, "change requires consensus");
            return Ok(ApprovalAssessment {
                decision: ApprovalDecision::RequiresConsensus,
                similarity,
            });
        }

        self.store
            .transition_change(
                change_id,
                &[ChangeStatus::Registered, ChangeStatus::Monitoring],
                ChangeStatus::AutoApproved,
            )
            .await?;
        let applying = self
            .store
            .transition_change(change_id, &[ChangeStatus::AutoApproved], ChangeStatus::Applying)
            .await?;

        // Concurrent evaluations can race to this point; only the caller
        // whose compare-and-set lands broadcasts and starts the watch.
        if applying.was_applied() {
            info!(change_id = %change_id, similarity, "change auto-approved, applying");
            self.bus
                .publish(BusMessage::ChangeApproved {
                    change_id: change_id.clone(),
                    payload: change.payload.clone(),
                })
                .await?;
            self.begin_stability_watch(change_id.clone());
        }

        Ok(ApprovalAssessment {
            decision: ApprovalDecision::AutoApproved,
            similarity,
        })
    }

    /// Rolls a change back because of `cause`.
    ///
    /// Idempotent: a change that is already rolled back yields its existing
    /// rollback event without another broadcast. A stable change can only
    /// be rolled back during the stabilization grace period.
    #[instrument(skip(self, cause))]
    pub async fn rollback(
        &self,
        change_id: &ChangeId,
        cause: BreachRecord,
    ) -> GovernanceResult<RollbackEvent> {
        let change = self
            .store
            .get_change(change_id)
            .await?
            .ok_or_else(|| GovernanceError::NotFound(format!("change {}", change_id)))?;

        if change.status == ChangeStatus::Stable {
            let grace = to_chrono(self.config.stabilization_grace, "stabilization_grace")?;
            let in_grace = change
                .stabilized_at
                .map(|at| Utc::now() - at <= grace)
                .unwrap_or(false);
            if !in_grace {
                return Err(GovernanceError::TerminalState(format!(
                    "change {} is stable and past its revocation window",
                    change_id
                )));
            }
        }

        let execution = self.store.execute_rollback(change_id, cause).await?;
        if execution.was_performed() {
            let event = execution.event();
            warn!(change_id = %change_id, metric = %event.metric, "change rolled back");
            self.cancel_stability_timer(change_id);
            self.publish_rollback(event).await?;
        }
        Ok(execution.event().clone())
    }

    /// Promotes an applying change to stable once its window has elapsed.
    ///
    /// Normally driven by the per-change stability watch; also safe to
    /// call from a sweep that catches watches lost to a restart.
    #[instrument(skip(self))]
    pub async fn confirm_stability(
        &self,
        change_id: &ChangeId,
    ) -> GovernanceResult<StabilityOutcome> {
        Self::stabilize(self.store.as_ref(), self.config.stability_window, change_id).await
    }

    /// Starts (or restarts) the timer that confirms stability for a change.
    pub fn begin_stability_watch(&self, change_id: ChangeId) {
        let store = Arc::clone(&self.store);
        let timers = Arc::clone(&self.stability_timers);
        let window = self.config.stability_window;
        let id = change_id.clone();

        debug!(change_id = %change_id, window_secs = window.as_secs(), "stability watch started");
        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            match Self::stabilize(store.as_ref(), window, &id).await {
                Ok(StabilityOutcome::Stabilized(_)) => {}
                Ok(outcome) => {
                    debug!(change_id = %id, ?outcome, "stability watch found nothing to confirm")
                }
                Err(err) => debug!(change_id = %id, error = %err, "stability check skipped"),
            }
            timers.remove(&id);
        });

        if let Some(previous) = self.stability_timers.insert(change_id, handle) {
            previous.abort();
        }
    }

    async fn stabilize(
        store: &dyn GovernanceStore,
        window: Duration,
        change_id: &ChangeId,
    ) -> GovernanceResult<StabilityOutcome> {
        let change = store
            .get_change(change_id)
            .await?
            .ok_or_else(|| GovernanceError::NotFound(format!("change {}", change_id)))?;

        if change.status != ChangeStatus::Applying {
            return Ok(StabilityOutcome::NotApplying(change.status));
        }
        let required = to_chrono(window, "stability_window")?;
        if Utc::now() - change.status_changed_at < required {
            return Ok(StabilityOutcome::WindowOpen);
        }

        let transition = store
            .transition_change(change_id, &[ChangeStatus::Applying], ChangeStatus::Stable)
            .await?;
        if transition.was_applied() {
            info!(change_id = %change_id, "change confirmed stable");
        }
        Ok(StabilityOutcome::Stabilized(transition.change().clone()))
    }

    async fn publish_rollback(&self, event: &RollbackEvent) -> GovernanceResult<()> {
        self.bus
            .publish(BusMessage::RollbackCommand {
                change_id: event.change_id.clone(),
                metric: event.metric,
                threshold: event.threshold,
                observed_value: event.observed_value,
            })
            .await?;
        Ok(())
    }

    fn cancel_stability_timer(&self, change_id: &ChangeId) {
        if let Some((_, handle)) = self.stability_timers.remove(change_id) {
            handle.abort();
        }
    }
}

impl Drop for SafetyMonitor {
    fn drop(&mut self) {
        for entry in self.stability_timers.iter() {
            entry.value().abort();
        }
    }
}

fn to_chrono(value: Duration, name: &str) -> GovernanceResult<chrono::Duration> {
    chrono::Duration::from_std(value)
        .map_err(|_| GovernanceError::Validation(format!("{name} duration is out of range")))
}
