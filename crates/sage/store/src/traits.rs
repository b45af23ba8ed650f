//! Storage trait definitions
//!
//! Split per logical table, combined by the [`GovernanceStore`] supertrait.
//! Methods that decide something from an aggregate take the deciding
//! closure as a parameter; implementations run it inside the transaction
//! that persists the outcome, with the row set re-read under that
//! transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sage_types::{
    BreachRecord, ChangeId, ChangeStatus, ChangeType, ConsensusProposal, InstanceId, MetricSample,
    Pattern, PatternId, PatternType, ProposalId, ProposalStatus, ProposedChange, RollbackEvent,
    StoreResult, Vote,
};

/// Bounds on the retained metric window for one change.
#[derive(Debug, Clone, Copy)]
pub struct SampleWindow {
    /// Maximum number of samples kept per change.
    pub max_samples: usize,
    /// Samples older than this are dropped.
    pub max_age: chrono::Duration,
}

/// What the metric evaluator decided for a freshly ingested sample.
#[derive(Debug)]
pub enum SampleDecision {
    /// Keep collecting. Breach rows are recorded; an optional status
    /// transition (e.g. first sample starting the monitoring phase) is
    /// applied atomically with the append.
    Continue {
        breaches: Vec<BreachRecord>,
        new_status: Option<ChangeStatus>,
    },
    /// Roll the change back, with `cause` as the deciding breach.
    RollBack {
        breaches: Vec<BreachRecord>,
        cause: BreachRecord,
    },
}

/// Result of ingesting one metric sample.
#[derive(Debug)]
pub enum IngestOutcome {
    /// Sample stored; the change (after any transition) is returned.
    Continued(ProposedChange),
    /// Sample stored and the change was rolled back by this call.
    RolledBack(RollbackEvent),
}

/// Evaluates a change and its post-append sample window.
///
/// Returning an error aborts the transaction; nothing is persisted.
pub type SampleEvaluator<'a> =
    &'a (dyn Fn(&ProposedChange, &[MetricSample]) -> StoreResult<SampleDecision> + Send + Sync);

/// Result of a compare-and-set status transition.
#[derive(Debug)]
pub enum ChangeTransition {
    /// This call performed the transition.
    Applied(ProposedChange),
    /// The change was already in the target status; nothing was written.
    Unchanged(ProposedChange),
}

impl ChangeTransition {
    pub fn change(&self) -> &ProposedChange {
        match self {
            ChangeTransition::Applied(change) | ChangeTransition::Unchanged(change) => change,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, ChangeTransition::Applied(_))
    }
}

/// Result of an idempotent rollback execution.
#[derive(Debug)]
pub enum RollbackExecution {
    /// This call rolled the change back and wrote the event.
    Performed(RollbackEvent),
    /// The change had already been rolled back; the existing event is returned.
    AlreadyRolledBack(RollbackEvent),
}

impl RollbackExecution {
    pub fn event(&self) -> &RollbackEvent {
        match self {
            RollbackExecution::Performed(event)
            | RollbackExecution::AlreadyRolledBack(event) => event,
        }
    }

    pub fn was_performed(&self) -> bool {
        matches!(self, RollbackExecution::Performed(_))
    }
}

/// Proposed changes and their rollback records.
#[async_trait]
pub trait ChangeStore {
    /// Inserts a new change. Fails with `Conflict` if the id is taken.
    async fn insert_change(&self, change: ProposedChange) -> StoreResult<()>;

    async fn get_change(&self, id: &ChangeId) -> StoreResult<Option<ProposedChange>>;

    /// Lists changes, optionally filtered by status.
    async fn list_changes(&self, status: Option<ChangeStatus>) -> StoreResult<Vec<ProposedChange>>;

    /// Payloads of `Stable` changes of the given type; the comparison
    /// corpus for similarity-based approval.
    async fn stable_payloads_for_type(
        &self,
        change_type: &ChangeType,
    ) -> StoreResult<Vec<serde_json::Value>>;

    /// Compare-and-set status transition.
    ///
    /// Errors with `TerminalState` when the current status is terminal and
    /// differs from `to`, and with `Conflict` when the current status is
    /// neither in `from` nor equal to `to`. A transition into `Stable`
    /// also records `stabilized_at`.
    async fn transition_change(
        &self,
        id: &ChangeId,
        from: &[ChangeStatus],
        to: ChangeStatus,
    ) -> StoreResult<ChangeTransition>;

    /// Rolls a change back exactly once.
    ///
    /// A change that is already `RolledBack` yields the existing event
    /// without mutation. Errors with `TerminalState` when the change is
    /// `Rejected` (there is nothing applied to roll back).
    async fn execute_rollback(
        &self,
        id: &ChangeId,
        cause: BreachRecord,
    ) -> StoreResult<RollbackExecution>;

    async fn list_rollback_events(&self, change_id: &ChangeId) -> StoreResult<Vec<RollbackEvent>>;
}

/// Metric samples and breach records, append-only per change.
#[async_trait]
pub trait MetricStore {
    /// Appends one sample and applies the evaluator's decision atomically.
    ///
    /// The transaction enforces per-change timestamp monotonicity (an
    /// out-of-order sample fails with `InvalidData` and is not persisted)
    /// and trims the window to `window` after the append. The evaluator
    /// sees the change row and the trimmed window including the new
    /// sample.
    async fn ingest_sample(
        &self,
        sample: MetricSample,
        window: SampleWindow,
        evaluate: SampleEvaluator<'_>,
    ) -> StoreResult<IngestOutcome>;

    async fn list_samples(&self, change_id: &ChangeId) -> StoreResult<Vec<MetricSample>>;

    async fn list_breaches(&self, change_id: &ChangeId) -> StoreResult<Vec<BreachRecord>>;
}

/// Decides a proposal from its full vote set; `None` keeps voting open.
pub type VoteDecider<'a> = &'a (dyn Fn(&[Vote]) -> Option<ProposalStatus> + Send + Sync);

/// Result of recording one vote.
#[derive(Debug)]
pub struct VoteRecorded {
    /// Proposal state after any decision.
    pub proposal: ConsensusProposal,
    /// Vote set after the upsert, one ballot per instance.
    pub votes: Vec<Vote>,
    /// Whether this call performed the deciding transition.
    pub decided_now: bool,
}

/// Consensus proposals and votes.
#[async_trait]
pub trait ProposalStore {
    /// Inserts a new proposal. Fails with `Conflict` when the change
    /// already has a proposal still in `Voting`.
    async fn insert_proposal(&self, proposal: ConsensusProposal) -> StoreResult<()>;

    async fn get_proposal(&self, id: &ProposalId) -> StoreResult<Option<ConsensusProposal>>;

    /// The proposal currently in `Voting` for a change, if any.
    async fn active_proposal_for(
        &self,
        change_id: &ChangeId,
    ) -> StoreResult<Option<ConsensusProposal>>;

    /// Upserts a ballot (last vote per instance wins), re-reads the vote
    /// set and applies the decider's verdict, all in one transaction.
    ///
    /// Errors with `TerminalState` when the proposal has already been
    /// decided.
    async fn record_vote(
        &self,
        proposal_id: &ProposalId,
        vote: Vote,
        decide: VoteDecider<'_>,
    ) -> StoreResult<VoteRecorded>;

    async fn list_votes(&self, proposal_id: &ProposalId) -> StoreResult<Vec<Vote>>;

    /// Moves every proposal still `Voting` with `created_at <= cutoff` to
    /// `TimedOut` and returns the moved rows.
    async fn expire_proposals(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<ConsensusProposal>>;
}

/// A single pattern observation reported by one instance.
#[derive(Debug, Clone)]
pub struct PatternReport {
    pub instance_id: InstanceId,
    pub pattern_type: PatternType,
    pub canonical_key: String,
    pub payload: serde_json::Value,
    pub success_rate: f64,
}

/// Aggregated cross-instance patterns.
#[async_trait]
pub trait PatternStore {
    /// Merges a report into the pattern keyed by (type, canonical key),
    /// creating it on first sight, and recomputes the consensus score via
    /// `rescore`, all in one transaction. Returns the merged pattern.
    async fn upsert_pattern(
        &self,
        report: PatternReport,
        rescore: &(dyn for<'a> Fn(&'a Pattern) -> f64 + Send + Sync),
    ) -> StoreResult<Pattern>;

    async fn get_pattern(&self, id: &PatternId) -> StoreResult<Option<Pattern>>;

    /// Lists patterns, optionally restricted to one type.
    async fn list_patterns(&self, pattern_type: Option<&PatternType>) -> StoreResult<Vec<Pattern>>;

    /// Sets `promoted` on every non-promoted pattern the predicate accepts
    /// and returns the newly promoted rows. Already promoted patterns are
    /// never returned, so re-runs cannot double-promote.
    async fn promote_if(
        &self,
        predicate: &(dyn for<'a> Fn(&'a Pattern) -> bool + Send + Sync),
    ) -> StoreResult<Vec<Pattern>>;
}

/// Combined storage interface the governance services depend on.
#[async_trait]
pub trait GovernanceStore:
    ChangeStore + MetricStore + ProposalStore + PatternStore + Send + Sync
{
}
