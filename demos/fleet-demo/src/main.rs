//! SAGE fleet demo binary.
//!
//! Walks a three-instance agent fleet through the whole governance story:
//! 1. A consensus round on a risky prompt change, through to stability.
//! 2. Auto-approval of a follow-up that resembles the stabilized change.
//! 3. Automatic rollback of a change with degraded trial metrics.
//! 4. Cross-instance pattern exchange, suggestion and promotion.
//! 5. The background sweep loops starting and stopping cleanly.
//!
//! Everything runs in process against the in-memory store and bus.

#![deny(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sage_bus::{BusMessage, InMemoryBus, Topic};
use sage_consensus::VoteOutcome;
use sage_safety::MetricOutcome;
use sage_service::{GovernanceConfig, GovernanceService};
use sage_similarity::TokenOverlap;
use sage_store::{ChangeStore, MemoryStore};
use sage_types::{
    BlastRadius, ChangeId, ChangeStatus, ChangeType, InstanceId, MetricReading, PatternType,
    ProposalMetadata, Reversibility, RiskLevel, RiskMetadata, VoteDecision,
};
use serde_json::json;
use tokio::sync::broadcast;

const BANNER: &str = r#"
 =================================================================
   SAGE  --  Safety and Governance Engine, fleet demo

   Three agent instances govern their own changes: trial metrics,
   quorum votes, similarity-based fast paths, automatic rollback,
   and shared pattern learning.
 =================================================================
"#;

fn section(title: &str) {
    println!();
    println!(" --- {} {}", title, "-".repeat(58usize.saturating_sub(title.len())));
}

fn ok(msg: &str) {
    println!("   [ok]   {}", msg);
}

fn info(msg: &str) {
    println!("   [..]   {}", msg);
}

fn warn(msg: &str) {
    println!("   [!!]   {}", msg);
}

/// Demo-scale tuning: short windows, nine reports to promote a pattern.
fn demo_config() -> GovernanceConfig {
    let mut config = GovernanceConfig::default();
    config.safety.stability_window = Duration::from_secs(2);
    config.sweep_interval = Duration::from_millis(500);
    config.aggregation_interval = Duration::from_millis(500);
    config.patterns.promotion.min_consensus_score = 0.90;
    config.patterns.promotion.min_success_rate = 0.90;
    config.patterns.promotion.min_usage = 9;
    config
}

fn template_v1() -> serde_json::Value {
    json!({"template": "answer with structured step by step reasoning"})
}

fn template_v2() -> serde_json::Value {
    json!({"template": "always answer with structured step by step reasoning"})
}

fn medium_risk() -> RiskMetadata {
    RiskMetadata {
        risk_level: RiskLevel::Medium,
        blast_radius: BlastRadius::Fleet,
        reversibility: Reversibility::Manual,
        test_coverage: 0.85,
    }
}

fn low_risk() -> RiskMetadata {
    RiskMetadata {
        risk_level: RiskLevel::Low,
        blast_radius: BlastRadius::SingleInstance,
        reversibility: Reversibility::Automatic,
        test_coverage: 0.95,
    }
}

fn proposal_evidence() -> ProposalMetadata {
    ProposalMetadata {
        expected_improvement: 0.14,
        blast_radius: BlastRadius::Fleet,
        rollback_time_secs: 90,
        trial_results: json!({"success_rate": 0.97, "samples": 2}),
    }
}

fn healthy_reading(timestamp: chrono::DateTime<Utc>) -> MetricReading {
    MetricReading {
        timestamp,
        success_rate: 0.97,
        error_rate: 0.01,
        latency_p95_ms: 420.0,
        cost_cents: 2.1,
        throughput_per_min: 115.0,
    }
}

fn degraded_reading(timestamp: chrono::DateTime<Utc>, success_rate: f64) -> MetricReading {
    MetricReading {
        timestamp,
        success_rate,
        error_rate: 0.06,
        latency_p95_ms: 900.0,
        cost_cents: 2.4,
        throughput_per_min: 80.0,
    }
}

fn drain(rx: &mut broadcast::Receiver<BusMessage>) -> Vec<BusMessage> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

fn describe(msg: &BusMessage) -> String {
    match msg {
        BusMessage::VotingRequest {
            change_id, proposer, ..
        } => format!("voting_request    {} proposed by {}", change_id, proposer),
        BusMessage::ChangeApproved { change_id, .. } => {
            format!("change_approved   {}", change_id)
        }
        BusMessage::ChangeRejected { change_id } => {
            format!("change_rejected   {}", change_id)
        }
        BusMessage::RollbackCommand {
            change_id,
            metric,
            threshold,
            observed_value,
        } => format!(
            "rollback_command  {} ({} {:.2} breached {:.2})",
            change_id, metric, observed_value, threshold
        ),
        BusMessage::PatternDiscovery {
            canonical_key,
            consensus_score,
            ..
        } => format!(
            "pattern_discovery {} (score {:.2})",
            canonical_key, consensus_score
        ),
        BusMessage::PatternPromotion {
            canonical_key,
            consensus_score,
            ..
        } => format!(
            "pattern_promotion {} (score {:.2})",
            canonical_key, consensus_score
        ),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(tracing::Level::WARN)
        .init();

    println!("{}", BANNER);

    if let Err(e) = run_demo().await {
        eprintln!();
        eprintln!("   [fatal] demo failed: {}", e);
        std::process::exit(1);
    }

    println!();
    println!(" =================================================================");
    println!("  Demo complete: one change stabilized, one fast-tracked,");
    println!("  one rolled back, one pattern promoted fleet-wide.");
    println!(" =================================================================");
    println!();
}

async fn run_demo() -> Result<(), Box<dyn std::error::Error>> {
    // Fleet bring-up.
    section("Fleet bring-up");

    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(InMemoryBus::new());
    let service = Arc::new(GovernanceService::new(
        store.clone(),
        bus.clone(),
        Arc::new(TokenOverlap),
        demo_config(),
    ));

    let mut voting_rx = bus.subscribe(Topic::VotingRequests);
    let mut approvals_rx = bus.subscribe(Topic::ApprovedChanges);
    let mut rollbacks_rx = bus.subscribe(Topic::RollbackCommands);
    let mut discoveries_rx = bus.subscribe(Topic::PatternDiscoveries);
    let mut promotions_rx = bus.subscribe(Topic::PatternPromotions);

    ok("three-instance fleet online: in-memory store, in-memory bus");
    info("stability window 2s, pattern promotion after 9 agreeing reports");

    // A change goes through the full consensus round.
    section("Consensus round");

    let v1 = ChangeId::new("prompt-structured-v1");
    service
        .register_change(
            InstanceId::new("i1"),
            v1.clone(),
            ChangeType::new("prompt_template"),
            template_v1(),
            medium_risk(),
        )
        .await?;
    ok("i1 registered prompt-structured-v1 (medium risk, manual rollback)");

    let base = Utc::now();
    for n in 0..2 {
        service
            .report_metrics(
                InstanceId::new("i1"),
                v1.clone(),
                healthy_reading(base + chrono::Duration::seconds(n)),
            )
            .await?;
    }
    info("two healthy trial samples recorded on i1");

    let assessment = service.evaluate_approval(&v1).await?;
    info(&format!(
        "fast-path check: {:?}, best similarity {:.2} (no stable history yet)",
        assessment.decision, assessment.similarity
    ));

    service
        .propose_change(
            InstanceId::new("i1"),
            v1.clone(),
            template_v1(),
            proposal_evidence(),
        )
        .await?;
    for msg in drain(&mut voting_rx) {
        info(&format!("bus: {}", describe(&msg)));
    }

    let ballots = [
        ("i1", 0.92, "trial metrics look solid"),
        ("i2", 0.88, "replicated the improvement locally"),
        ("i3", 0.90, "no regressions in my workload"),
    ];
    for (voter, confidence, reason) in ballots {
        let outcome = service
            .vote_on_change(
                InstanceId::new(voter),
                v1.clone(),
                VoteDecision::Approve,
                confidence,
                reason,
            )
            .await?;
        match outcome {
            VoteOutcome::Recorded { votes } => {
                info(&format!("{} approved ({} of 3 ballots in)", voter, votes));
            }
            VoteOutcome::ConsensusReached { status } => {
                ok(&format!("{} approved, consensus reached: {}", voter, status));
            }
        }
    }
    for msg in drain(&mut approvals_rx) {
        info(&format!("bus: {}", describe(&msg)));
    }

    info("waiting out the stability window...");
    let mut status = ChangeStatus::Applying;
    for _ in 0..50 {
        status = store
            .get_change(&v1)
            .await?
            .map(|c| c.status)
            .unwrap_or(status);
        if status == ChangeStatus::Stable {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    ok(&format!("prompt-structured-v1 is now {}", status));

    // A similar follow-up takes the fast path.
    section("Similarity fast path");

    let v2 = ChangeId::new("prompt-structured-v2");
    service
        .register_change(
            InstanceId::new("i2"),
            v2.clone(),
            ChangeType::new("prompt_template"),
            template_v2(),
            low_risk(),
        )
        .await?;
    ok("i2 registered prompt-structured-v2 (low risk, auto-reversible)");

    let assessment = service.evaluate_approval(&v2).await?;
    ok(&format!(
        "fast-path check: {:?}, best similarity {:.2}",
        assessment.decision, assessment.similarity
    ));
    for msg in drain(&mut approvals_rx) {
        info(&format!("bus: {}", describe(&msg)));
    }

    // Degraded metrics roll a change back.
    section("Guarded rollback");

    let cache = ChangeId::new("planner-aggressive-cache");
    service
        .register_change(
            InstanceId::new("i3"),
            cache.clone(),
            ChangeType::new("planner_config"),
            json!({"strategy": "cache every planner result", "ttl_secs": 3600}),
            medium_risk(),
        )
        .await?;
    ok("i3 registered planner-aggressive-cache (medium risk)");

    let base = Utc::now();
    for (n, rate) in [(0i64, 0.82), (1, 0.80), (2, 0.78)] {
        let outcome = service
            .report_metrics(
                InstanceId::new("i3"),
                cache.clone(),
                degraded_reading(base + chrono::Duration::seconds(n), rate),
            )
            .await?;
        match outcome {
            MetricOutcome::Monitored(change) => {
                info(&format!(
                    "sample {}: success rate {:.2}, still {}",
                    n + 1,
                    rate,
                    change.status
                ));
            }
            MetricOutcome::ThresholdBreach(event) => {
                warn(&format!(
                    "sample {}: {} {:.2} under threshold {:.2} for 3 samples, rolled back",
                    n + 1,
                    event.metric,
                    event.observed_value,
                    event.threshold
                ));
            }
        }
    }
    for msg in drain(&mut rollbacks_rx) {
        info(&format!("bus: {}", describe(&msg)));
    }

    // Instances trade what worked.
    section("Pattern exchange");

    let reports = [
        ("i1", 0.97),
        ("i2", 0.95),
        ("i3", 0.96),
    ];
    for round in 0..3 {
        for (instance, rate) in reports {
            service
                .record_pattern(
                    InstanceId::new(instance),
                    PatternType::new("retry_policy"),
                    json!({
                        "name": "exponential_backoff",
                        "policy": "retry with exponential backoff and jitter",
                    }),
                    rate,
                )
                .await?;
        }
        info(&format!("round {}: all three instances reported", round + 1));
    }
    info(&format!(
        "bus: {} discovery messages",
        drain(&mut discoveries_rx).len()
    ));

    let suggestions = service
        .suggest_pattern(
            &PatternType::new("retry_policy"),
            &json!({"hint": "need a retry policy with backoff"}),
        )
        .await?;
    for s in &suggestions {
        info(&format!(
            "suggestion: {} (similarity {:.2}, success {:.2})",
            s.pattern.canonical_key, s.similarity, s.success_rate
        ));
    }

    let promoted = service.aggregate_learnings().await?;
    ok(&format!("aggregation promoted {} pattern(s)", promoted));
    for msg in drain(&mut promotions_rx) {
        info(&format!("bus: {}", describe(&msg)));
    }

    // Background loops start and stop cleanly.
    section("Background sweeps");

    let runner = tokio::spawn(service.clone().start());
    info("sweep and aggregation loops running (500ms interval)");
    tokio::time::sleep(Duration::from_millis(1200)).await;
    service.stop().await;
    runner.await?;
    ok("loops wound down after stop");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sage_similarity::SimilarityStrategy;

    #[test]
    fn follow_up_template_clears_the_fast_path_bar() {
        let score = TokenOverlap.score(&template_v1(), &template_v2());
        assert!(
            score >= 0.85,
            "demo payloads must stay similar enough to fast-track, got {:.3}",
            score
        );
    }

    #[test]
    fn demo_risk_profiles_are_valid() {
        assert!(medium_risk().validate().is_ok());
        assert!(low_risk().validate().is_ok());
    }

    #[test]
    fn demo_promotion_bars_admit_nine_agreeing_reports() {
        let config = demo_config();
        assert!(config.patterns.promotion.min_usage <= 9);
        assert!(config.patterns.promotion.min_consensus_score <= 0.96);
        assert_eq!(config.patterns.promotion.min_instances, 3);
    }

    #[tokio::test]
    async fn demo_ballots_reach_consensus() {
        let store = Arc::new(MemoryStore::new());
        let service = GovernanceService::new(
            store.clone(),
            Arc::new(InMemoryBus::new()),
            Arc::new(TokenOverlap),
            demo_config(),
        );

        let id = ChangeId::new("c1");
        service
            .register_change(
                InstanceId::new("i1"),
                id.clone(),
                ChangeType::new("prompt_template"),
                template_v1(),
                medium_risk(),
            )
            .await
            .unwrap();
        service
            .propose_change(InstanceId::new("i1"), id.clone(), template_v1(), proposal_evidence())
            .await
            .unwrap();

        let mut last = None;
        for (voter, confidence, reason) in [
            ("i1", 0.92, "solid"),
            ("i2", 0.88, "agreed"),
            ("i3", 0.90, "agreed"),
        ] {
            last = Some(
                service
                    .vote_on_change(
                        InstanceId::new(voter),
                        id.clone(),
                        VoteDecision::Approve,
                        confidence,
                        reason,
                    )
                    .await
                    .unwrap(),
            );
        }
        assert!(matches!(
            last,
            Some(VoteOutcome::ConsensusReached { .. })
        ));
    }
}
