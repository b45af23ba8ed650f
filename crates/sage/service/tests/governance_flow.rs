use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sage_bus::{BusMessage, InMemoryBus, Topic};
use sage_consensus::{ExecutionOutcome, VoteOutcome};
use sage_safety::{ApprovalDecision, MetricOutcome};
use sage_service::{GovernanceConfig, GovernanceService};
use sage_similarity::FixedSimilarity;
use sage_store::{ChangeStore, MemoryStore};
use sage_types::{
    BlastRadius, ChangeId, ChangeStatus, ChangeType, GovernanceError, InstanceId, MetricKind,
    MetricReading, PatternType, ProposalMetadata, ProposalStatus, ProposedChange, Reversibility,
    RiskLevel, RiskMetadata, VoteDecision,
};
use serde_json::json;

struct Fleet {
    store: Arc<MemoryStore>,
    bus: Arc<InMemoryBus>,
    service: GovernanceService,
}

fn fleet_with(similarity: f64, config: GovernanceConfig) -> Fleet {
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(InMemoryBus::new());
    let service = GovernanceService::new(
        store.clone(),
        bus.clone(),
        Arc::new(FixedSimilarity(similarity)),
        config,
    );
    Fleet {
        store,
        bus,
        service,
    }
}

fn fleet(similarity: f64) -> Fleet {
    fleet_with(similarity, GovernanceConfig::default())
}

fn low_risk() -> RiskMetadata {
    RiskMetadata {
        risk_level: RiskLevel::Low,
        blast_radius: BlastRadius::SingleInstance,
        reversibility: Reversibility::Automatic,
        test_coverage: 0.95,
    }
}

fn high_risk() -> RiskMetadata {
    RiskMetadata {
        risk_level: RiskLevel::High,
        blast_radius: BlastRadius::Fleet,
        reversibility: Reversibility::Manual,
        test_coverage: 0.95,
    }
}

fn consensus_risk() -> RiskMetadata {
    RiskMetadata {
        risk_level: RiskLevel::Medium,
        blast_radius: BlastRadius::Fleet,
        reversibility: Reversibility::Manual,
        test_coverage: 0.80,
    }
}

fn metadata() -> ProposalMetadata {
    ProposalMetadata {
        expected_improvement: 0.12,
        blast_radius: BlastRadius::Fleet,
        rollback_time_secs: 120,
        trial_results: json!({"success_rate": 0.97}),
    }
}

fn reading_at(timestamp: chrono::DateTime<Utc>, success_rate: f64) -> MetricReading {
    MetricReading {
        timestamp,
        success_rate,
        error_rate: 0.01,
        latency_p95_ms: 400.0,
        cost_cents: 2.0,
        throughput_per_min: 110.0,
    }
}

async fn register(fleet: &Fleet, id: &str, risk: RiskMetadata) -> ChangeId {
    fleet
        .service
        .register_change(
            InstanceId::new("i1"),
            ChangeId::new(id),
            ChangeType::new("prompt_template"),
            json!({"template": "v2 with structured reasoning"}),
            risk,
        )
        .await
        .expect("registration should succeed")
}

async fn seed_stable(store: &MemoryStore, id: &str) {
    let now = Utc::now();
    store
        .insert_change(ProposedChange {
            id: ChangeId::new(id),
            instance_id: InstanceId::new("i0"),
            change_type: ChangeType::new("prompt_template"),
            payload: json!({"template": "v1 with structured reasoning"}),
            risk: low_risk(),
            status: ChangeStatus::Stable,
            created_at: now,
            status_changed_at: now,
            stabilized_at: Some(now),
        })
        .await
        .expect("seeding the stable corpus should succeed");
}

#[tokio::test]
async fn similar_low_risk_change_is_auto_approved() {
    let f = fleet(0.90);
    seed_stable(&f.store, "c0").await;
    let change_id = register(&f, "c1", low_risk()).await;
    let mut approvals = f.bus.subscribe(Topic::ApprovedChanges);

    let assessment = f
        .service
        .evaluate_approval(&change_id)
        .await
        .expect("evaluation should succeed");
    assert_eq!(assessment.decision, ApprovalDecision::AutoApproved);
    assert_eq!(assessment.similarity, 0.90);

    let change = f.store.get_change(&change_id).await.unwrap().unwrap();
    assert_eq!(change.status, ChangeStatus::Applying);

    match approvals.try_recv().expect("approval should broadcast") {
        BusMessage::ChangeApproved {
            change_id: id,
            payload,
        } => {
            assert_eq!(id, change_id);
            assert_eq!(payload["template"], "v2 with structured reasoning");
        }
        other => panic!("expected ChangeApproved, got {}", other.kind()),
    }
}

#[tokio::test]
async fn high_risk_changes_always_take_the_vote() {
    let f = fleet(1.0);
    seed_stable(&f.store, "c0").await;
    let change_id = register(&f, "c1", high_risk()).await;

    let assessment = f
        .service
        .evaluate_approval(&change_id)
        .await
        .expect("evaluation should succeed");
    assert_eq!(assessment.decision, ApprovalDecision::RequiresConsensus);
    assert_eq!(assessment.similarity, 1.0);

    let change = f.store.get_change(&change_id).await.unwrap().unwrap();
    assert_eq!(change.status, ChangeStatus::Registered);
}

#[tokio::test]
async fn a_confident_quorum_approves_and_applies_once() {
    let f = fleet(0.0);
    let change_id = register(&f, "c1", consensus_risk()).await;
    let proposal_id = f
        .service
        .propose_change(
            InstanceId::new("i1"),
            change_id.clone(),
            json!({"template": "v2 with structured reasoning"}),
            metadata(),
        )
        .await
        .expect("proposal should open");
    let mut approvals = f.bus.subscribe(Topic::ApprovedChanges);

    let first = f
        .service
        .vote_on_change(
            InstanceId::new("i1"),
            change_id.clone(),
            VoteDecision::Approve,
            0.90,
            "trial went well",
        )
        .await
        .unwrap();
    assert!(matches!(first, VoteOutcome::Recorded { votes: 1 }));

    f.service
        .vote_on_change(
            InstanceId::new("i2"),
            change_id.clone(),
            VoteDecision::Approve,
            0.88,
            "replicated the trial",
        )
        .await
        .unwrap();

    let third = f
        .service
        .vote_on_change(
            InstanceId::new("i3"),
            change_id.clone(),
            VoteDecision::Approve,
            0.86,
            "no regressions here",
        )
        .await
        .unwrap();
    assert!(matches!(
        third,
        VoteOutcome::ConsensusReached {
            status: ProposalStatus::Approved
        }
    ));

    let change = f.store.get_change(&change_id).await.unwrap().unwrap();
    assert_eq!(change.status, ChangeStatus::Applying);

    // Re-driving execution settles without a second broadcast.
    let rerun = f
        .service
        .execute_if_consensus(&proposal_id)
        .await
        .expect("re-execution should be safe");
    assert!(matches!(rerun, ExecutionOutcome::Applied(_)));

    assert!(matches!(
        approvals.try_recv().expect("approval should broadcast"),
        BusMessage::ChangeApproved { .. }
    ));
    assert!(approvals.try_recv().is_err(), "only one approval message");
}

#[tokio::test]
async fn one_confident_rejection_blocks_the_fleet() {
    let f = fleet(0.0);
    let change_id = register(&f, "c1", consensus_risk()).await;
    f.service
        .propose_change(
            InstanceId::new("i1"),
            change_id.clone(),
            json!({"template": "v2 with structured reasoning"}),
            metadata(),
        )
        .await
        .expect("proposal should open");
    let mut approvals = f.bus.subscribe(Topic::ApprovedChanges);

    for voter in ["i1", "i2"] {
        let outcome = f
            .service
            .vote_on_change(
                InstanceId::new(voter),
                change_id.clone(),
                VoteDecision::Approve,
                0.90,
                "looks fine",
            )
            .await
            .unwrap();
        assert!(matches!(outcome, VoteOutcome::Recorded { .. }));
    }

    let veto = f
        .service
        .vote_on_change(
            InstanceId::new("i3"),
            change_id.clone(),
            VoteDecision::Reject,
            0.95,
            "saw data loss under this template",
        )
        .await
        .unwrap();
    assert!(matches!(
        veto,
        VoteOutcome::ConsensusReached {
            status: ProposalStatus::Rejected
        }
    ));

    let change = f.store.get_change(&change_id).await.unwrap().unwrap();
    assert_eq!(change.status, ChangeStatus::Rejected);
    assert!(matches!(
        approvals.try_recv().expect("rejection should broadcast"),
        BusMessage::ChangeRejected { .. }
    ));
}

#[tokio::test]
async fn sustained_degraded_metrics_roll_the_change_back() {
    let f = fleet(0.0);
    let change_id = register(&f, "c1", consensus_risk()).await;
    let mut rollbacks = f.bus.subscribe(Topic::RollbackCommands);
    let base = Utc::now();

    for i in 0..2 {
        let outcome = f
            .service
            .report_metrics(
                InstanceId::new("i1"),
                change_id.clone(),
                reading_at(base + chrono::Duration::seconds(i), 0.85),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, MetricOutcome::Monitored(_)));
    }

    let third = f
        .service
        .report_metrics(
            InstanceId::new("i1"),
            change_id.clone(),
            reading_at(base + chrono::Duration::seconds(2), 0.85),
        )
        .await
        .unwrap();
    let event = match third {
        MetricOutcome::ThresholdBreach(event) => event,
        other => panic!("expected a rollback, got {:?}", other),
    };
    assert_eq!(event.metric, MetricKind::SuccessRate);
    assert_eq!(event.threshold, 0.90);
    assert_eq!(event.observed_value, 0.85);

    let change = f.store.get_change(&change_id).await.unwrap().unwrap();
    assert_eq!(change.status, ChangeStatus::RolledBack);

    match rollbacks.try_recv().expect("rollback should broadcast") {
        BusMessage::RollbackCommand {
            change_id: id,
            metric,
            ..
        } => {
            assert_eq!(id, change_id);
            assert_eq!(metric, MetricKind::SuccessRate);
        }
        other => panic!("expected RollbackCommand, got {}", other.kind()),
    }

    let late = f
        .service
        .report_metrics(
            InstanceId::new("i1"),
            change_id.clone(),
            reading_at(base + chrono::Duration::seconds(3), 0.97),
        )
        .await;
    assert!(matches!(late, Err(GovernanceError::TerminalState(_))));
}

#[tokio::test]
async fn proven_patterns_promote_exactly_once() {
    let f = fleet(0.0);
    let mut promotions = f.bus.subscribe(Topic::PatternPromotions);
    let rates = [0.96, 0.95, 0.97];

    for i in 0..100 {
        f.service
            .record_pattern(
                InstanceId::new(format!("i{}", i % 3)),
                PatternType::new("prompt_template"),
                json!({"name": "structured_cot", "template": "reason step by step"}),
                rates[i % 3],
            )
            .await
            .expect("pattern report should succeed");
    }

    let promoted = f.service.aggregate_learnings().await.unwrap();
    assert_eq!(promoted, 1);
    assert_eq!(f.service.aggregate_learnings().await.unwrap(), 0);

    match promotions.try_recv().expect("promotion should broadcast") {
        BusMessage::PatternPromotion {
            canonical_key,
            consensus_score,
            ..
        } => {
            assert_eq!(canonical_key, "structured_cot");
            assert!(consensus_score >= 0.95);
        }
        other => panic!("expected PatternPromotion, got {}", other.kind()),
    }
    assert!(promotions.try_recv().is_err(), "only one promotion message");
}

#[tokio::test]
async fn consensus_approval_graduates_to_stable_after_the_window() {
    let mut config = GovernanceConfig::default();
    config.safety.stability_window = Duration::from_millis(50);
    let f = fleet_with(0.0, config);

    let change_id = register(&f, "c1", consensus_risk()).await;
    f.service
        .propose_change(
            InstanceId::new("i1"),
            change_id.clone(),
            json!({"template": "v2 with structured reasoning"}),
            metadata(),
        )
        .await
        .expect("proposal should open");

    for voter in ["i1", "i2", "i3"] {
        f.service
            .vote_on_change(
                InstanceId::new(voter),
                change_id.clone(),
                VoteDecision::Approve,
                0.90,
                "trial went well",
            )
            .await
            .unwrap();
    }

    for _ in 0..100 {
        let change = f.store.get_change(&change_id).await.unwrap().unwrap();
        if change.status == ChangeStatus::Stable {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let change = f.store.get_change(&change_id).await.unwrap().unwrap();
    assert_eq!(change.status, ChangeStatus::Stable);
    assert!(change.stabilized_at.is_some());
}
