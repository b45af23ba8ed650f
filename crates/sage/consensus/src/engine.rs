//! The consensus engine
//!
//! Runs fleet voting for changes that did not qualify for auto-approval.
//! Vote decisions are computed by the store's transaction via
//! [`QuorumPolicy`], so exactly one ballot observes `decided_now` and
//! executes the outcome. Execution itself is a compare-and-set walk over
//! the change row, which makes re-running it safe after a crash between
//! the decision and the broadcast.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sage_bus::{BusMessage, GovernanceBus};
use sage_store::{ChangeStore, GovernanceStore, ProposalStore};
use sage_types::{
    ChangeId, ChangeStatus, ConsensusProposal, GovernanceError, GovernanceResult, InstanceId,
    ProposalId, ProposalMetadata, ProposalStatus, ProposedChange, StoreError, Vote, VoteDecision,
};
use tracing::{debug, info, instrument, warn};

use crate::config::ConsensusConfig;
use crate::quorum::QuorumPolicy;

/// Outcome of casting one ballot.
#[derive(Debug)]
pub enum VoteOutcome {
    /// Ballot stored; voting continues.
    Recorded { votes: usize },
    /// This ballot decided the proposal.
    ConsensusReached { status: ProposalStatus },
}

/// Outcome of executing a decided proposal. Safe to re-run.
#[derive(Debug)]
pub enum ExecutionOutcome {
    /// The approved payload was broadcast; the change is applying.
    Applied(ProposedChange),
    /// The rejection was recorded and announced.
    Rejected(ProposedChange),
    /// The proposal is still collecting ballots.
    StillVoting,
    /// The change had already moved past execution.
    AlreadySettled(ProposedChange),
}

/// Coordinates proposals, ballots and decision execution for one fleet.
pub struct ConsensusEngine {
    store: Arc<dyn GovernanceStore>,
    bus: Arc<dyn GovernanceBus>,
    policy: QuorumPolicy,
    config: ConsensusConfig,
}

impl ConsensusEngine {
    pub fn new(
        store: Arc<dyn GovernanceStore>,
        bus: Arc<dyn GovernanceBus>,
        config: ConsensusConfig,
    ) -> Self {
        Self {
            store,
            bus,
            policy: QuorumPolicy::new(config.clone()),
            config,
        }
    }

    /// Opens a voting round for a registered change and broadcasts the
    /// request to the fleet.
    ///
    /// The change moves to `Voting`; at most one proposal per change may
    /// be open at a time.
    #[instrument(skip(self, payload, metadata))]
    pub async fn propose_change(
        &self,
        instance_id: InstanceId,
        change_id: ChangeId,
        payload: serde_json::Value,
        metadata: ProposalMetadata,
    ) -> GovernanceResult<ProposalId> {
        match self
            .store
            .transition_change(
                &change_id,
                &[ChangeStatus::Registered, ChangeStatus::Monitoring],
                ChangeStatus::Voting,
            )
            .await
        {
            Ok(_) => {}
            Err(StoreError::NotFound(_)) => {
                return Err(GovernanceError::NotRegistered(format!(
                    "change {change_id} was never registered"
                )));
            }
            Err(StoreError::TerminalState(_)) => {
                return Err(GovernanceError::NotRegistered(format!(
                    "change {change_id} is closed to new proposals"
                )));
            }
            Err(err) => return Err(err.into()),
        }

        let proposal = ConsensusProposal {
            id: ProposalId::generate(),
            change_id: change_id.clone(),
            proposer: instance_id.clone(),
            payload,
            metadata: metadata.clone(),
            status: ProposalStatus::Voting,
            created_at: Utc::now(),
            decided_at: None,
        };
        let proposal_id = proposal.id.clone();
        self.store.insert_proposal(proposal).await?;

        self.bus
            .publish(BusMessage::VotingRequest {
                proposal_id: proposal_id.clone(),
                change_id: change_id.clone(),
                proposer: instance_id,
                metadata,
            })
            .await?;

        info!(proposal_id = %proposal_id, change_id = %change_id, "voting opened");
        Ok(proposal_id)
    }

    /// Records one instance's ballot on the open proposal for a change,
    /// and executes the decision when this ballot completes it.
    ///
    /// A revote by the same instance replaces its earlier ballot.
    #[instrument(skip(self, reason))]
    pub async fn vote_on_change(
        &self,
        instance_id: InstanceId,
        change_id: ChangeId,
        decision: VoteDecision,
        confidence: f64,
        reason: impl Into<String>,
    ) -> GovernanceResult<VoteOutcome> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(GovernanceError::Validation(format!(
                "confidence must be within 0.0..=1.0, got {confidence}"
            )));
        }

        let proposal = self
            .store
            .active_proposal_for(&change_id)
            .await?
            .ok_or_else(|| {
                GovernanceError::NotFound(format!("no open proposal for change {change_id}"))
            })?;

        let vote = Vote {
            proposal_id: proposal.id.clone(),
            instance_id,
            decision,
            confidence,
            reason: reason.into(),
            created_at: Utc::now(),
        };

        let policy = &self.policy;
        let decide = move |votes: &[Vote]| policy.evaluate(votes).status();
        let recorded = self.store.record_vote(&proposal.id, vote, &decide).await?;

        if recorded.decided_now {
            info!(
                proposal_id = %recorded.proposal.id,
                change_id = %change_id,
                status = %recorded.proposal.status,
                ballots = recorded.votes.len(),
                "consensus reached"
            );
            self.execute(&recorded.proposal).await?;
            return Ok(VoteOutcome::ConsensusReached {
                status: recorded.proposal.status,
            });
        }

        debug!(
            proposal_id = %recorded.proposal.id,
            ballots = recorded.votes.len(),
            "ballot recorded"
        );
        Ok(VoteOutcome::Recorded {
            votes: recorded.votes.len(),
        })
    }

    /// Executes a proposal's decision against its change. Idempotent:
    /// re-running never broadcasts twice.
    #[instrument(skip(self))]
    pub async fn execute_if_consensus(
        &self,
        proposal_id: &ProposalId,
    ) -> GovernanceResult<ExecutionOutcome> {
        let proposal = self
            .store
            .get_proposal(proposal_id)
            .await?
            .ok_or_else(|| GovernanceError::NotFound(format!("proposal {proposal_id}")))?;
        self.execute(&proposal).await
    }

    /// Times out proposals whose voting window has elapsed as of `now`
    /// and executes each as a rejection.
    #[instrument(skip(self))]
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> GovernanceResult<Vec<ProposalId>> {
        let timeout = chrono::Duration::from_std(self.config.voting_timeout).map_err(|_| {
            GovernanceError::Validation("voting_timeout does not fit a chrono duration".into())
        })?;
        let expired = self.store.expire_proposals(now - timeout).await?;

        let mut timed_out = Vec::with_capacity(expired.len());
        for proposal in &expired {
            warn!(
                proposal_id = %proposal.id,
                change_id = %proposal.change_id,
                "voting window elapsed without consensus"
            );
            self.execute(proposal).await?;
            timed_out.push(proposal.id.clone());
        }
        Ok(timed_out)
    }

    async fn execute(&self, proposal: &ConsensusProposal) -> GovernanceResult<ExecutionOutcome> {
        match proposal.status {
            ProposalStatus::Voting => Ok(ExecutionOutcome::StillVoting),
            ProposalStatus::Approved => self.execute_approval(proposal).await,
            ProposalStatus::Rejected | ProposalStatus::TimedOut => {
                self.execute_rejection(proposal).await
            }
        }
    }

    /// Walks the change through `Voting -> Approved -> Applying`; only
    /// the caller that lands the `Applying` hop broadcasts the payload.
    async fn execute_approval(
        &self,
        proposal: &ConsensusProposal,
    ) -> GovernanceResult<ExecutionOutcome> {
        match self
            .store
            .transition_change(
                &proposal.change_id,
                &[ChangeStatus::Voting],
                ChangeStatus::Approved,
            )
            .await
        {
            // Conflict means an earlier execution already advanced the
            // change past Approved; the second hop settles either way.
            Ok(_) | Err(StoreError::Conflict(_)) => {}
            Err(StoreError::TerminalState(_)) => {
                return self.already_settled(&proposal.change_id).await;
            }
            Err(err) => return Err(err.into()),
        }

        let applying = match self
            .store
            .transition_change(
                &proposal.change_id,
                &[ChangeStatus::Approved],
                ChangeStatus::Applying,
            )
            .await
        {
            Ok(transition) => transition,
            Err(StoreError::TerminalState(_)) => {
                return self.already_settled(&proposal.change_id).await;
            }
            Err(err) => return Err(err.into()),
        };

        if applying.was_applied() {
            info!(
                change_id = %proposal.change_id,
                proposal_id = %proposal.id,
                "approved change is applying"
            );
            self.bus
                .publish(BusMessage::ChangeApproved {
                    change_id: proposal.change_id.clone(),
                    payload: proposal.payload.clone(),
                })
                .await?;
        }
        Ok(ExecutionOutcome::Applied(applying.change().clone()))
    }

    async fn execute_rejection(
        &self,
        proposal: &ConsensusProposal,
    ) -> GovernanceResult<ExecutionOutcome> {
        let rejected = match self
            .store
            .transition_change(
                &proposal.change_id,
                &[ChangeStatus::Voting],
                ChangeStatus::Rejected,
            )
            .await
        {
            Ok(transition) => transition,
            Err(StoreError::TerminalState(_)) => {
                return self.already_settled(&proposal.change_id).await;
            }
            Err(err) => return Err(err.into()),
        };

        if rejected.was_applied() {
            info!(
                change_id = %proposal.change_id,
                proposal_id = %proposal.id,
                outcome = %proposal.status,
                "change rejected by consensus"
            );
            self.bus
                .publish(BusMessage::ChangeRejected {
                    change_id: proposal.change_id.clone(),
                })
                .await?;
        }
        Ok(ExecutionOutcome::Rejected(rejected.change().clone()))
    }

    async fn already_settled(&self, change_id: &ChangeId) -> GovernanceResult<ExecutionOutcome> {
        let change = self
            .store
            .get_change(change_id)
            .await?
            .ok_or_else(|| GovernanceError::NotFound(format!("change {change_id}")))?;
        Ok(ExecutionOutcome::AlreadySettled(change))
    }
}
