//! End-to-end pipeline scenarios over the in-memory repository.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opportunity_forge::agent::AgentPhase;
use opportunity_forge::error::{OrchestratorError, StoreError};
use opportunity_forge::opportunity::{
    Competition, Opportunity, OpportunityCandidate, OpportunityFilter, REJECTED_STAGE,
};
use opportunity_forge::pipeline::{
    FixedScorer, OpportunityScorer, PipelineComponents, PipelineConfig, PipelineOrchestrator,
    RejectReason, ScorerError, StageAssessment, StageDefinition, VisitResult,
};
use opportunity_forge::proof::actions;

struct FailingScorer;

#[async_trait]
impl OpportunityScorer for FailingScorer {
    async fn assess(
        &self,
        _opportunity: &Opportunity,
        _stage: &StageDefinition,
    ) -> Result<StageAssessment, ScorerError> {
        Err(ScorerError::Failed("market data unavailable".to_string()))
    }
}

/// Returns a well-formed result carrying a non-finite score.
struct NanScorer;

#[async_trait]
impl OpportunityScorer for NanScorer {
    async fn assess(
        &self,
        _opportunity: &Opportunity,
        _stage: &StageDefinition,
    ) -> Result<StageAssessment, ScorerError> {
        Ok(StageAssessment::new(f64::NAN, 0.1))
    }
}

/// Never finishes; only cancellation or a deadline ends the visit.
struct StalledScorer;

#[async_trait]
impl OpportunityScorer for StalledScorer {
    async fn assess(
        &self,
        _opportunity: &Opportunity,
        _stage: &StageDefinition,
    ) -> Result<StageAssessment, ScorerError> {
        std::future::pending().await
    }
}

async fn orchestrator(
    config: PipelineConfig,
    scorer: Arc<dyn OpportunityScorer>,
) -> Arc<PipelineOrchestrator> {
    let components = PipelineComponents::in_memory(&config)
        .await
        .expect("components");
    Arc::new(PipelineOrchestrator::new(&config, components, scorer))
}

fn dubai_candidate() -> OpportunityCandidate {
    OpportunityCandidate::new(
        "Dubai Marina serviced studios",
        "Furnished studios for short corporate stays",
        "Dubai",
        "listing-scan",
    )
    .with_competition(Competition::High)
    .with_revenue_potential("AED 40k / month")
}

async fn assert_agents_idle(orch: &PipelineOrchestrator) {
    for agent in orch.components().agents.list().await {
        assert_eq!(agent.status, AgentPhase::Idle, "agent {}", agent.agent_id);
        assert!(agent.current_task.is_none());
        assert_eq!(agent.progress, 0);
    }
}

#[tokio::test]
async fn dubai_opportunity_reaches_validation() {
    let orch = orchestrator(PipelineConfig::default(), Arc::new(FixedScorer::new(0.82, 0.12))).await;
    let opp = orch.submit(dubai_candidate()).await.expect("submit");
    assert_eq!(opp.stage, "discovery");
    assert!(!opp.validated);

    let expected = [
        VisitResult::Advanced {
            to: "analysis".to_string(),
        },
        VisitResult::Advanced {
            to: "validation".to_string(),
        },
        VisitResult::Validated,
    ];
    for expected in expected {
        let report = orch.tick().await.expect("tick");
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].result, expected);
        assert_agents_idle(&orch).await;
    }

    let stored = orch.components().store.get(opp.id).await.expect("get");
    assert!(stored.validated);
    assert_eq!(stored.stage, "validation");
    assert!((stored.score - 0.82).abs() < 1e-9);

    // A terminal opportunity is never visited again.
    let report = orch.tick().await.expect("tick");
    assert!(report.outcomes.is_empty());

    let validated = orch
        .components()
        .store
        .list(&OpportunityFilter::new().with_validated(true))
        .await;
    assert_eq!(validated.len(), 1);

    let proof_log = &orch.components().proof_log;
    assert!(proof_log.len().await >= 3);
    proof_log.verify_integrity().await.expect("chain intact");

    let records = proof_log.records(1, u64::MAX).await;
    let actions_seen: Vec<&str> = records.iter().map(|r| r.entry.action.as_str()).collect();
    assert_eq!(actions_seen.first(), Some(&actions::OPPORTUNITY_CREATED));
    assert!(actions_seen.contains(&actions::OPPORTUNITY_ADVANCED));
    assert_eq!(
        actions_seen
            .iter()
            .filter(|a| **a == actions::OPPORTUNITY_VALIDATED)
            .count(),
        1
    );
    for pair in records.windows(2) {
        assert!(pair[0].entry.timestamp <= pair[1].entry.timestamp);
    }

    let stats = orch.stats().await;
    assert_eq!(stats.advanced, 2);
    assert_eq!(stats.validated, 1);
    assert_eq!(stats.successful_visits, 3);
}

#[tokio::test]
async fn successful_visits_raise_capability_confidence() {
    let orch = orchestrator(PipelineConfig::default(), Arc::new(FixedScorer::new(0.9, 0.0))).await;
    orch.submit(dubai_candidate()).await.expect("submit");
    orch.tick().await.expect("tick");

    let research = orch
        .components()
        .capabilities
        .get("market-research")
        .await
        .expect("capability");
    assert_eq!(research.usage_count, 1);
    assert!((research.confidence - 0.73).abs() < 1e-9);
}

#[tokio::test]
async fn score_below_floor_rejects_and_blocks_advance() {
    let orch = orchestrator(PipelineConfig::default(), Arc::new(FixedScorer::new(0.2, -0.3))).await;
    let opp = orch.submit(dubai_candidate()).await.expect("submit");

    orch.tick().await.expect("discovery tick");
    let report = orch.tick().await.expect("analysis tick");
    assert_eq!(
        report.outcomes[0].result,
        VisitResult::Rejected {
            reason: RejectReason::ScoreBelowFloor
        }
    );

    let stored = orch.components().store.get(opp.id).await.expect("get");
    assert_eq!(stored.stage, REJECTED_STAGE);
    assert_eq!(stored.rejection_reason.as_deref(), Some("score-below-floor"));
    assert!(stored.is_terminal());

    let err = orch
        .components()
        .store
        .advance(opp.id, "validation")
        .await
        .expect_err("rejected opportunities cannot advance");
    assert!(matches!(err, StoreError::InvalidTransition { .. }));

    let err = orch.reject(opp.id, "again").await.expect_err("already rejected");
    assert!(matches!(
        err,
        OrchestratorError::Store(StoreError::InvalidTransition { .. })
    ));
    assert_agents_idle(&orch).await;
}

#[tokio::test]
async fn repeated_failures_reject_after_max_retries() {
    let config = PipelineConfig::default().with_max_retries(3);
    let orch = orchestrator(config, Arc::new(FailingScorer)).await;
    let opp = orch.submit(dubai_candidate()).await.expect("submit");

    // Discovery does not consult the scorer.
    let report = orch.tick().await.expect("tick");
    assert!(matches!(report.outcomes[0].result, VisitResult::Advanced { .. }));

    for failures in 1..=3 {
        let report = orch.tick().await.expect("tick");
        assert_eq!(report.outcomes[0].result, VisitResult::Retrying { failures });
        let stored = orch.components().store.get(opp.id).await.expect("get");
        assert_eq!(stored.stage, "analysis");
        assert_agents_idle(&orch).await;
    }

    let report = orch.tick().await.expect("tick");
    assert_eq!(
        report.outcomes[0].result,
        VisitResult::Rejected {
            reason: RejectReason::MaxRetriesExceeded
        }
    );

    let stored = orch.components().store.get(opp.id).await.expect("get");
    assert_eq!(stored.stage, REJECTED_STAGE);
    assert_eq!(stored.rejection_reason.as_deref(), Some("max-retries-exceeded"));
    assert_agents_idle(&orch).await;

    let analysis = orch
        .components()
        .capabilities
        .get("trend-analysis")
        .await
        .expect("capability");
    assert_eq!(analysis.usage_count, 4);
    assert!(analysis.confidence < 0.7);

    let failed_tasks = orch
        .components()
        .proof_log
        .records(1, u64::MAX)
        .await
        .into_iter()
        .filter(|r| r.entry.action == actions::TASK_FAILED)
        .count();
    assert_eq!(failed_tasks, 4);
    assert_eq!(orch.stats().await.failed_visits, 4);
}

#[tokio::test]
async fn non_finite_scores_count_as_failed_attempts() {
    let config = PipelineConfig::default().with_max_retries(3);
    let orch = orchestrator(config, Arc::new(NanScorer)).await;
    let opp = orch.submit(dubai_candidate()).await.expect("submit");
    orch.tick().await.expect("discovery tick");

    for failures in 1..=3 {
        let report = orch.tick().await.expect("tick");
        assert_eq!(report.outcomes[0].result, VisitResult::Retrying { failures });
        let stored = orch.components().store.get(opp.id).await.expect("get");
        assert_eq!(stored.stage, "analysis");
        assert_eq!(stored.score, 0.0);
    }

    let report = orch.tick().await.expect("tick");
    assert_eq!(
        report.outcomes[0].result,
        VisitResult::Rejected {
            reason: RejectReason::MaxRetriesExceeded
        }
    );
    assert_agents_idle(&orch).await;

    let analysis = orch
        .components()
        .capabilities
        .get("trend-analysis")
        .await
        .expect("capability");
    assert_eq!(analysis.usage_count, 4);
    assert!(analysis.confidence < 0.7);

    let records = orch.components().proof_log.records(1, u64::MAX).await;
    assert!(records.iter().all(|r| r.entry.action != actions::OPPORTUNITY_SCORED));
    let failed_tasks = records
        .iter()
        .filter(|r| r.entry.action == actions::TASK_FAILED)
        .count();
    assert_eq!(failed_tasks, 4);
}

#[tokio::test]
async fn cancelling_an_agent_leaves_the_opportunity_queued() {
    let orch = orchestrator(PipelineConfig::default(), Arc::new(StalledScorer)).await;
    let opp = orch.submit(dubai_candidate()).await.expect("submit");
    orch.tick().await.expect("discovery tick");

    let report = orch.dispatch().await.expect("dispatch");
    assert_eq!(report.jobs.len(), 1);

    let busy = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let agents = orch.components().agents.list().await;
            if let Some(agent) = agents.into_iter().find(|a| !a.status.is_idle()) {
                break agent;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("an agent picks up the visit");
    assert!(busy.current_task.is_some());

    let err = orch.reject(opp.id, "operator").await.expect_err("visit in flight");
    assert!(matches!(err, OrchestratorError::InFlight(id) if id == opp.id));

    let status = orch
        .cancel_agent(&busy.agent_id, "operator request")
        .await
        .expect("cancel");
    assert_eq!(status.status, AgentPhase::Idle);

    let mut jobs = report.jobs;
    let outcome = jobs.remove(0).await.expect("visit task");
    assert_eq!(outcome.result, VisitResult::Cancelled);
    assert_eq!(orch.in_flight_count().await, 0);
    assert_agents_idle(&orch).await;

    let stored = orch.components().store.get(opp.id).await.expect("get");
    assert_eq!(stored.stage, "analysis");
    assert!(!stored.is_terminal());

    let cancelled = orch
        .components()
        .proof_log
        .records(1, u64::MAX)
        .await
        .into_iter()
        .filter(|r| r.entry.action == actions::TASK_CANCELLED)
        .count();
    assert_eq!(cancelled, 1);
}

#[tokio::test]
async fn deadline_expiry_cancels_the_visit() {
    let config = PipelineConfig::default().with_task_deadline(Duration::from_millis(50));
    let orch = orchestrator(config, Arc::new(StalledScorer)).await;
    let opp = orch.submit(dubai_candidate()).await.expect("submit");
    orch.tick().await.expect("discovery tick");

    let report = orch.tick().await.expect("analysis tick");
    assert_eq!(report.outcomes[0].result, VisitResult::Cancelled);
    assert_agents_idle(&orch).await;

    // Expiry is not a failed attempt.
    let stored = orch.components().store.get(opp.id).await.expect("get");
    assert_eq!(stored.stage, "analysis");
    assert_eq!(orch.stats().await.failed_visits, 0);
    assert_eq!(orch.stats().await.cancelled_visits, 1);
}
