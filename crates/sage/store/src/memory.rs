//! In-memory storage implementation
//!
//! One lock guards all tables, so every trait method is a single critical
//! section. That is what makes the decision closures serializable: the
//! aggregate a closure sees cannot change before its outcome is written.

use crate::traits::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sage_types::{
    BreachRecord, ChangeId, ChangeStatus, ChangeType, ConsensusProposal, MetricSample, Pattern,
    PatternId, PatternType, ProposalId, ProposalStatus, ProposedChange, RollbackEvent, StoreError,
    StoreResult, Vote,
};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Tables {
    changes: HashMap<ChangeId, ProposedChange>,
    samples: HashMap<ChangeId, Vec<MetricSample>>,
    breaches: HashMap<ChangeId, Vec<BreachRecord>>,
    rollbacks: HashMap<ChangeId, RollbackEvent>,
    proposals: HashMap<ProposalId, ConsensusProposal>,
    votes: HashMap<ProposalId, Vec<Vote>>,
    patterns: HashMap<PatternId, Pattern>,
}

/// In-memory storage for tests and single-process deployments
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply_status(change: &mut ProposedChange, to: ChangeStatus, now: DateTime<Utc>) {
    change.status = to;
    change.status_changed_at = now;
    if to == ChangeStatus::Stable {
        change.stabilized_at = Some(now);
    }
}

fn trim_window(samples: &mut Vec<MetricSample>, window: SampleWindow) {
    if let Some(newest) = samples.last().map(|s| s.timestamp) {
        let cutoff = newest - window.max_age;
        samples.retain(|s| s.timestamp >= cutoff);
    }
    if samples.len() > window.max_samples {
        let excess = samples.len() - window.max_samples;
        samples.drain(0..excess);
    }
}

#[async_trait]
impl ChangeStore for MemoryStore {
    async fn insert_change(&self, change: ProposedChange) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        if tables.changes.contains_key(&change.id) {
            return Err(StoreError::Conflict(format!(
                "change {} already registered",
                change.id
            )));
        }
        tables.changes.insert(change.id.clone(), change);
        Ok(())
    }

    async fn get_change(&self, id: &ChangeId) -> StoreResult<Option<ProposedChange>> {
        let tables = self.tables.read().await;
        Ok(tables.changes.get(id).cloned())
    }

    async fn list_changes(&self, status: Option<ChangeStatus>) -> StoreResult<Vec<ProposedChange>> {
        let tables = self.tables.read().await;
        Ok(tables
            .changes
            .values()
            .filter(|c| status.map_or(true, |s| c.status == s))
            .cloned()
            .collect())
    }

    async fn stable_payloads_for_type(
        &self,
        change_type: &ChangeType,
    ) -> StoreResult<Vec<serde_json::Value>> {
        let tables = self.tables.read().await;
        Ok(tables
            .changes
            .values()
            .filter(|c| c.status == ChangeStatus::Stable && &c.change_type == change_type)
            .map(|c| c.payload.clone())
            .collect())
    }

    async fn transition_change(
        &self,
        id: &ChangeId,
        from: &[ChangeStatus],
        to: ChangeStatus,
    ) -> StoreResult<ChangeTransition> {
        let mut tables = self.tables.write().await;
        let change = tables
            .changes
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("change {}", id)))?;

        if change.status == to {
            return Ok(ChangeTransition::Unchanged(change.clone()));
        }
        if change.status.is_terminal() {
            return Err(StoreError::TerminalState(format!(
                "change {} is {}",
                id, change.status
            )));
        }
        if !from.contains(&change.status) {
            return Err(StoreError::Conflict(format!(
                "change {} is {}, expected one of {:?}",
                id, change.status, from
            )));
        }

        apply_status(change, to, Utc::now());
        Ok(ChangeTransition::Applied(change.clone()))
    }

    async fn execute_rollback(
        &self,
        id: &ChangeId,
        cause: BreachRecord,
    ) -> StoreResult<RollbackExecution> {
        let mut tables = self.tables.write().await;
        let change = tables
            .changes
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("change {}", id)))?;

        match change.status {
            ChangeStatus::RolledBack => {
                let event = tables
                    .rollbacks
                    .get(id)
                    .cloned()
                    .ok_or_else(|| StoreError::NotFound(format!("rollback event for {}", id)))?;
                Ok(RollbackExecution::AlreadyRolledBack(event))
            }
            ChangeStatus::Rejected => Err(StoreError::TerminalState(format!(
                "change {} is rejected, nothing to roll back",
                id
            ))),
            _ => {
                let now = Utc::now();
                apply_status(change, ChangeStatus::RolledBack, now);
                let event = RollbackEvent {
                    change_id: id.clone(),
                    metric: cause.metric,
                    threshold: cause.threshold,
                    observed_value: cause.observed_value,
                    timestamp: now,
                };
                tables.rollbacks.insert(id.clone(), event.clone());
                Ok(RollbackExecution::Performed(event))
            }
        }
    }

    async fn list_rollback_events(&self, change_id: &ChangeId) -> StoreResult<Vec<RollbackEvent>> {
        let tables = self.tables.read().await;
        Ok(tables.rollbacks.get(change_id).cloned().into_iter().collect())
    }
}

#[async_trait]
impl MetricStore for MemoryStore {
    async fn ingest_sample(
        &self,
        sample: MetricSample,
        window: SampleWindow,
        evaluate: SampleEvaluator<'_>,
    ) -> StoreResult<IngestOutcome> {
        let mut tables = self.tables.write().await;
        let change = tables
            .changes
            .get(&sample.change_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("change {}", sample.change_id)))?;

        let existing = tables.samples.get(&sample.change_id);
        if let Some(last) = existing.and_then(|s| s.last()) {
            if sample.timestamp < last.timestamp {
                return Err(StoreError::InvalidData(format!(
                    "sample for {} is older than the latest recorded sample",
                    sample.change_id
                )));
            }
        }

        // Build the post-append window first; nothing is committed until
        // the evaluator has accepted the sample.
        let change_id = sample.change_id.clone();
        let mut appended = existing.cloned().unwrap_or_default();
        appended.push(sample);
        trim_window(&mut appended, window);

        let decision = evaluate(&change, &appended)?;

        tables.samples.insert(change_id.clone(), appended);
        let now = Utc::now();
        match decision {
            SampleDecision::Continue {
                breaches,
                new_status,
            } => {
                tables
                    .breaches
                    .entry(change_id.clone())
                    .or_default()
                    .extend(breaches);
                let change = tables
                    .changes
                    .get_mut(&change_id)
                    .ok_or_else(|| StoreError::NotFound(format!("change {}", change_id)))?;
                if let Some(status) = new_status {
                    apply_status(change, status, now);
                }
                Ok(IngestOutcome::Continued(change.clone()))
            }
            SampleDecision::RollBack { breaches, cause } => {
                tables
                    .breaches
                    .entry(change_id.clone())
                    .or_default()
                    .extend(breaches);
                let change = tables
                    .changes
                    .get_mut(&change_id)
                    .ok_or_else(|| StoreError::NotFound(format!("change {}", change_id)))?;
                apply_status(change, ChangeStatus::RolledBack, now);
                let event = RollbackEvent {
                    change_id: change_id.clone(),
                    metric: cause.metric,
                    threshold: cause.threshold,
                    observed_value: cause.observed_value,
                    timestamp: now,
                };
                tables.rollbacks.insert(change_id, event.clone());
                Ok(IngestOutcome::RolledBack(event))
            }
        }
    }

    async fn list_samples(&self, change_id: &ChangeId) -> StoreResult<Vec<MetricSample>> {
        let tables = self.tables.read().await;
        Ok(tables.samples.get(change_id).cloned().unwrap_or_default())
    }

    async fn list_breaches(&self, change_id: &ChangeId) -> StoreResult<Vec<BreachRecord>> {
        let tables = self.tables.read().await;
        Ok(tables.breaches.get(change_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl ProposalStore for MemoryStore {
    async fn insert_proposal(&self, proposal: ConsensusProposal) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let active = tables
            .proposals
            .values()
            .any(|p| p.change_id == proposal.change_id && p.status == ProposalStatus::Voting);
        if active {
            return Err(StoreError::Conflict(format!(
                "change {} already has an open proposal",
                proposal.change_id
            )));
        }
        tables.proposals.insert(proposal.id.clone(), proposal);
        Ok(())
    }

    async fn get_proposal(&self, id: &ProposalId) -> StoreResult<Option<ConsensusProposal>> {
        let tables = self.tables.read().await;
        Ok(tables.proposals.get(id).cloned())
    }

    async fn active_proposal_for(
        &self,
        change_id: &ChangeId,
    ) -> StoreResult<Option<ConsensusProposal>> {
        let tables = self.tables.read().await;
        Ok(tables
            .proposals
            .values()
            .find(|p| &p.change_id == change_id && p.status == ProposalStatus::Voting)
            .cloned())
    }

    async fn record_vote(
        &self,
        proposal_id: &ProposalId,
        vote: Vote,
        decide: VoteDecider<'_>,
    ) -> StoreResult<VoteRecorded> {
        let mut tables = self.tables.write().await;
        let proposal = tables
            .proposals
            .get(proposal_id)
            .ok_or_else(|| StoreError::NotFound(format!("proposal {}", proposal_id)))?;
        if proposal.status != ProposalStatus::Voting {
            return Err(StoreError::TerminalState(format!(
                "proposal {} is already {}",
                proposal_id, proposal.status
            )));
        }

        let ballots = tables.votes.entry(proposal_id.clone()).or_default();
        match ballots.iter_mut().find(|v| v.instance_id == vote.instance_id) {
            Some(existing) => *existing = vote,
            None => ballots.push(vote),
        }
        let votes = ballots.clone();

        let verdict = decide(&votes);
        let proposal = tables
            .proposals
            .get_mut(proposal_id)
            .ok_or_else(|| StoreError::NotFound(format!("proposal {}", proposal_id)))?;
        let decided_now = match verdict {
            Some(status) => {
                proposal.status = status;
                proposal.decided_at = Some(Utc::now());
                true
            }
            None => false,
        };

        Ok(VoteRecorded {
            proposal: proposal.clone(),
            votes,
            decided_now,
        })
    }

    async fn list_votes(&self, proposal_id: &ProposalId) -> StoreResult<Vec<Vote>> {
        let tables = self.tables.read().await;
        Ok(tables.votes.get(proposal_id).cloned().unwrap_or_default())
    }

    async fn expire_proposals(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<ConsensusProposal>> {
        let mut tables = self.tables.write().await;
        let now = Utc::now();
        let mut expired = Vec::new();
        for proposal in tables.proposals.values_mut() {
            if proposal.status == ProposalStatus::Voting && proposal.created_at <= cutoff {
                proposal.status = ProposalStatus::TimedOut;
                proposal.decided_at = Some(now);
                expired.push(proposal.clone());
            }
        }
        Ok(expired)
    }
}

#[async_trait]
impl PatternStore for MemoryStore {
    async fn upsert_pattern(
        &self,
        report: PatternReport,
        rescore: &(dyn for<'a> Fn(&'a Pattern) -> f64 + Send + Sync),
    ) -> StoreResult<Pattern> {
        let mut tables = self.tables.write().await;
        let now = Utc::now();

        let existing = tables.patterns.values_mut().find(|p| {
            p.pattern_type == report.pattern_type && p.canonical_key == report.canonical_key
        });

        let merged = match existing {
            Some(pattern) => {
                pattern.source_instances.insert(report.instance_id.clone());
                pattern
                    .per_instance_success_rate
                    .insert(report.instance_id, report.success_rate);
                pattern.payload = report.payload;
                pattern.usage_count += 1;
                pattern.updated_at = now;
                pattern.consensus_score = rescore(pattern);
                pattern.clone()
            }
            None => {
                let mut pattern = Pattern {
                    id: PatternId::generate(),
                    pattern_type: report.pattern_type,
                    canonical_key: report.canonical_key,
                    payload: report.payload,
                    source_instances: [report.instance_id.clone()].into_iter().collect(),
                    per_instance_success_rate: [(report.instance_id, report.success_rate)]
                        .into_iter()
                        .collect(),
                    consensus_score: 0.0,
                    usage_count: 1,
                    promoted: false,
                    created_at: now,
                    updated_at: now,
                };
                pattern.consensus_score = rescore(&pattern);
                tables.patterns.insert(pattern.id.clone(), pattern.clone());
                pattern
            }
        };

        Ok(merged)
    }

    async fn get_pattern(&self, id: &PatternId) -> StoreResult<Option<Pattern>> {
        let tables = self.tables.read().await;
        Ok(tables.patterns.get(id).cloned())
    }

    async fn list_patterns(&self, pattern_type: Option<&PatternType>) -> StoreResult<Vec<Pattern>> {
        let tables = self.tables.read().await;
        Ok(tables
            .patterns
            .values()
            .filter(|p| pattern_type.map_or(true, |t| &p.pattern_type == t))
            .cloned()
            .collect())
    }

    async fn promote_if(
        &self,
        predicate: &(dyn for<'a> Fn(&'a Pattern) -> bool + Send + Sync),
    ) -> StoreResult<Vec<Pattern>> {
        let mut tables = self.tables.write().await;
        let now = Utc::now();
        let mut promoted = Vec::new();
        for pattern in tables.patterns.values_mut() {
            if !pattern.promoted && predicate(pattern) {
                pattern.promoted = true;
                pattern.updated_at = now;
                promoted.push(pattern.clone());
            }
        }
        Ok(promoted)
    }
}

impl GovernanceStore for MemoryStore {}

#[cfg(test)]
mod tests {
    use super::*;
    use sage_types::{
        BlastRadius, BreachSeverity, InstanceId, MetricKind, MetricReading, ProposalMetadata,
        Reversibility, RiskLevel, RiskMetadata, VoteDecision,
    };

    fn test_change(id: &str) -> ProposedChange {
        let now = Utc::now();
        ProposedChange {
            id: ChangeId::new(id),
            instance_id: InstanceId::new("instance-1"),
            change_type: ChangeType::new("prompt_template"),
            payload: serde_json::json!({"template": "v2"}),
            risk: RiskMetadata {
                risk_level: RiskLevel::Low,
                blast_radius: BlastRadius::SingleInstance,
                reversibility: Reversibility::Automatic,
                test_coverage: 0.95,
            },
            status: ChangeStatus::Registered,
            created_at: now,
            status_changed_at: now,
            stabilized_at: None,
        }
    }

    fn test_reading(success_rate: f64) -> MetricReading {
        MetricReading {
            timestamp: Utc::now(),
            success_rate,
            error_rate: 1.0 - success_rate,
            latency_p95_ms: 500.0,
            cost_cents: 1.0,
            throughput_per_min: 100.0,
        }
    }

    fn test_breach(change_id: &ChangeId) -> BreachRecord {
        BreachRecord {
            change_id: change_id.clone(),
            metric: MetricKind::SuccessRate,
            severity: BreachSeverity::Critical,
            threshold: 0.90,
            observed_value: 0.5,
            timestamp: Utc::now(),
        }
    }

    fn test_proposal(change_id: &str) -> ConsensusProposal {
        ConsensusProposal {
            id: ProposalId::generate(),
            change_id: ChangeId::new(change_id),
            proposer: InstanceId::new("instance-1"),
            payload: serde_json::json!({"template": "v2"}),
            metadata: ProposalMetadata {
                expected_improvement: 0.1,
                blast_radius: BlastRadius::Fleet,
                rollback_time_secs: 60,
                trial_results: serde_json::json!({}),
            },
            status: ProposalStatus::Voting,
            created_at: Utc::now(),
            decided_at: None,
        }
    }

    fn test_vote(proposal_id: &ProposalId, instance: &str, decision: VoteDecision) -> Vote {
        Vote {
            proposal_id: proposal_id.clone(),
            instance_id: InstanceId::new(instance),
            decision,
            confidence: 0.9,
            reason: "trial looked good".into(),
            created_at: Utc::now(),
        }
    }

    fn day_window() -> SampleWindow {
        SampleWindow {
            max_samples: 10,
            max_age: chrono::Duration::hours(24),
        }
    }

    #[tokio::test]
    async fn duplicate_change_registration_conflicts() {
        let store = MemoryStore::new();
        store.insert_change(test_change("c1")).await.unwrap();
        let err = store.insert_change(test_change("c1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let store = MemoryStore::new();
        store.insert_change(test_change("c1")).await.unwrap();
        let id = ChangeId::new("c1");

        let result = store
            .transition_change(&id, &[ChangeStatus::Registered], ChangeStatus::Monitoring)
            .await
            .unwrap();
        assert!(result.was_applied());

        // Wrong precondition set.
        let err = store
            .transition_change(&id, &[ChangeStatus::Registered], ChangeStatus::Voting)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // Same target twice reports Unchanged without writing.
        let result = store
            .transition_change(&id, &[ChangeStatus::Registered], ChangeStatus::Monitoring)
            .await
            .unwrap();
        assert!(!result.was_applied());
    }

    #[tokio::test]
    async fn terminal_change_rejects_transitions() {
        let store = MemoryStore::new();
        store.insert_change(test_change("c1")).await.unwrap();
        let id = ChangeId::new("c1");
        store
            .transition_change(&id, &[ChangeStatus::Registered], ChangeStatus::Rejected)
            .await
            .unwrap();

        let err = store
            .transition_change(&id, &[ChangeStatus::Rejected], ChangeStatus::Monitoring)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TerminalState(_)));
    }

    #[tokio::test]
    async fn rollback_is_idempotent() {
        let store = MemoryStore::new();
        store.insert_change(test_change("c1")).await.unwrap();
        let id = ChangeId::new("c1");
        store
            .transition_change(&id, &[ChangeStatus::Registered], ChangeStatus::Monitoring)
            .await
            .unwrap();

        let first = store.execute_rollback(&id, test_breach(&id)).await.unwrap();
        assert!(first.was_performed());

        let second = store.execute_rollback(&id, test_breach(&id)).await.unwrap();
        assert!(!second.was_performed());
        assert_eq!(second.event().timestamp, first.event().timestamp);

        let events = store.list_rollback_events(&id).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn out_of_order_sample_is_rejected_and_not_persisted() {
        let store = MemoryStore::new();
        store.insert_change(test_change("c1")).await.unwrap();
        let id = ChangeId::new("c1");
        let keep = |_: &ProposedChange, _: &[MetricSample]| {
            Ok(SampleDecision::Continue {
                breaches: vec![],
                new_status: None,
            })
        };

        let mut first = test_reading(0.99);
        first.timestamp = Utc::now();
        let mut stale = test_reading(0.99);
        stale.timestamp = first.timestamp - chrono::Duration::minutes(5);

        store
            .ingest_sample(
                first.into_sample(id.clone(), InstanceId::new("i1")),
                day_window(),
                &keep,
            )
            .await
            .unwrap();
        let err = store
            .ingest_sample(
                stale.into_sample(id.clone(), InstanceId::new("i1")),
                day_window(),
                &keep,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidData(_)));
        assert_eq!(store.list_samples(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn evaluator_error_aborts_the_append() {
        let store = MemoryStore::new();
        store.insert_change(test_change("c1")).await.unwrap();
        let id = ChangeId::new("c1");

        let reject = |_: &ProposedChange, _: &[MetricSample]| {
            Err(StoreError::TerminalState("change is settled".into()))
        };
        let err = store
            .ingest_sample(
                test_reading(0.99).into_sample(id.clone(), InstanceId::new("i1")),
                day_window(),
                &reject,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TerminalState(_)));
        assert!(store.list_samples(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rollback_decision_applies_atomically() {
        let store = MemoryStore::new();
        store.insert_change(test_change("c1")).await.unwrap();
        let id = ChangeId::new("c1");

        let roll = |change: &ProposedChange, _: &[MetricSample]| {
            let cause = BreachRecord {
                change_id: change.id.clone(),
                metric: MetricKind::SuccessRate,
                severity: BreachSeverity::Critical,
                threshold: 0.90,
                observed_value: 0.42,
                timestamp: Utc::now(),
            };
            Ok(SampleDecision::RollBack {
                breaches: vec![cause.clone()],
                cause,
            })
        };
        let outcome = store
            .ingest_sample(
                test_reading(0.42).into_sample(id.clone(), InstanceId::new("i1")),
                day_window(),
                &roll,
            )
            .await
            .unwrap();

        assert!(matches!(outcome, IngestOutcome::RolledBack(_)));
        let change = store.get_change(&id).await.unwrap().unwrap();
        assert_eq!(change.status, ChangeStatus::RolledBack);
        assert_eq!(store.list_breaches(&id).await.unwrap().len(), 1);
        assert_eq!(store.list_rollback_events(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sample_window_is_bounded() {
        let store = MemoryStore::new();
        store.insert_change(test_change("c1")).await.unwrap();
        let id = ChangeId::new("c1");
        let keep = |_: &ProposedChange, _: &[MetricSample]| {
            Ok(SampleDecision::Continue {
                breaches: vec![],
                new_status: None,
            })
        };
        let window = SampleWindow {
            max_samples: 3,
            max_age: chrono::Duration::hours(24),
        };

        let base = Utc::now();
        for i in 0..5 {
            let mut reading = test_reading(0.99);
            reading.timestamp = base + chrono::Duration::seconds(i);
            store
                .ingest_sample(
                    reading.into_sample(id.clone(), InstanceId::new("i1")),
                    window,
                    &keep,
                )
                .await
                .unwrap();
        }

        let samples = store.list_samples(&id).await.unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].timestamp, base + chrono::Duration::seconds(2));
    }

    #[tokio::test]
    async fn second_active_proposal_for_change_conflicts() {
        let store = MemoryStore::new();
        store.insert_proposal(test_proposal("c1")).await.unwrap();
        let err = store.insert_proposal(test_proposal("c1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn revote_replaces_earlier_ballot() {
        let store = MemoryStore::new();
        let proposal = test_proposal("c1");
        let pid = proposal.id.clone();
        store.insert_proposal(proposal).await.unwrap();
        let no_decision = |_: &[Vote]| None;

        store
            .record_vote(&pid, test_vote(&pid, "i1", VoteDecision::Approve), &no_decision)
            .await
            .unwrap();
        let recorded = store
            .record_vote(&pid, test_vote(&pid, "i1", VoteDecision::Reject), &no_decision)
            .await
            .unwrap();

        assert_eq!(recorded.votes.len(), 1);
        assert_eq!(recorded.votes[0].decision, VoteDecision::Reject);
    }

    #[tokio::test]
    async fn decider_transition_happens_exactly_once() {
        let store = MemoryStore::new();
        let proposal = test_proposal("c1");
        let pid = proposal.id.clone();
        store.insert_proposal(proposal).await.unwrap();
        let approve_at_two = |votes: &[Vote]| {
            if votes.len() >= 2 {
                Some(ProposalStatus::Approved)
            } else {
                None
            }
        };

        let first = store
            .record_vote(&pid, test_vote(&pid, "i1", VoteDecision::Approve), &approve_at_two)
            .await
            .unwrap();
        assert!(!first.decided_now);

        let second = store
            .record_vote(&pid, test_vote(&pid, "i2", VoteDecision::Approve), &approve_at_two)
            .await
            .unwrap();
        assert!(second.decided_now);
        assert_eq!(second.proposal.status, ProposalStatus::Approved);

        // A late vote bounces off the decided proposal.
        let err = store
            .record_vote(&pid, test_vote(&pid, "i3", VoteDecision::Approve), &approve_at_two)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TerminalState(_)));
    }

    #[tokio::test]
    async fn expire_moves_only_overdue_proposals() {
        let store = MemoryStore::new();
        let old = test_proposal("c1");
        let old_id = old.id.clone();
        store.insert_proposal(old).await.unwrap();
        let fresh = test_proposal("c2");
        let fresh_id = fresh.id.clone();
        store.insert_proposal(fresh).await.unwrap();

        // Cutoff between the two creation times.
        let cutoff = Utc::now() - chrono::Duration::seconds(1);
        let none = store.expire_proposals(cutoff).await.unwrap();
        assert!(none.is_empty());

        let expired = store.expire_proposals(Utc::now()).await.unwrap();
        assert_eq!(expired.len(), 2);
        for id in [old_id, fresh_id] {
            let proposal = store.get_proposal(&id).await.unwrap().unwrap();
            assert_eq!(proposal.status, ProposalStatus::TimedOut);
        }
    }

    #[tokio::test]
    async fn pattern_reports_merge_by_canonical_key() {
        let store = MemoryStore::new();
        let report = |instance: &str, rate: f64| PatternReport {
            instance_id: InstanceId::new(instance),
            pattern_type: PatternType::new("retry_strategy"),
            canonical_key: "backoff".into(),
            payload: serde_json::json!({"name": "backoff"}),
            success_rate: rate,
        };
        let rescore = |p: &Pattern| p.mean_success_rate();

        let first = store.upsert_pattern(report("i1", 0.8), &rescore).await.unwrap();
        assert_eq!(first.usage_count, 1);
        let second = store.upsert_pattern(report("i2", 1.0), &rescore).await.unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.usage_count, 2);
        assert_eq!(second.instance_count(), 2);
        assert!((second.consensus_score - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn promote_if_never_repromotes() {
        let store = MemoryStore::new();
        let report = PatternReport {
            instance_id: InstanceId::new("i1"),
            pattern_type: PatternType::new("retry_strategy"),
            canonical_key: "backoff".into(),
            payload: serde_json::json!({"name": "backoff"}),
            success_rate: 1.0,
        };
        store
            .upsert_pattern(report, &|p: &Pattern| p.mean_success_rate())
            .await
            .unwrap();

        let all = |_: &Pattern| true;
        let promoted = store.promote_if(&all).await.unwrap();
        assert_eq!(promoted.len(), 1);
        assert!(promoted[0].promoted);

        let again = store.promote_if(&all).await.unwrap();
        assert!(again.is_empty());
    }
}
