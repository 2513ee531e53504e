//! Stage visits that hit storage faults part way through.

mod common;

use std::sync::Arc;

use common::ScriptedRepository;
use opportunity_forge::opportunity::OpportunityCandidate;
use opportunity_forge::pipeline::{
    FixedScorer, PipelineComponents, PipelineConfig, PipelineOrchestrator, VisitResult,
};
use opportunity_forge::proof::actions;

async fn orchestrator(repository: Arc<ScriptedRepository>) -> Arc<PipelineOrchestrator> {
    let config = PipelineConfig::default().with_num_agents(1);
    let components = PipelineComponents::open(&config, repository)
        .await
        .expect("components");
    Arc::new(PipelineOrchestrator::new(
        &config,
        components,
        Arc::new(FixedScorer::new(0.82, 0.12)),
    ))
}

fn candidate() -> OpportunityCandidate {
    OpportunityCandidate::new(
        "Business Bay co-working",
        "Flexible desks for freelancers",
        "Dubai",
        "listing-scan",
    )
}

async fn count_action(orch: &PipelineOrchestrator, action: &str) -> usize {
    orch.components()
        .proof_log
        .records(1, u64::MAX)
        .await
        .into_iter()
        .filter(|r| r.entry.action == action)
        .count()
}

#[tokio::test]
async fn lost_completion_entry_frees_the_agent_for_a_retry() {
    let repository = ScriptedRepository::new();
    let orch = orchestrator(repository.clone()).await;
    let opp = orch.submit(candidate()).await.expect("submit");

    repository.fail_appends(actions::TASK_COMPLETED, 1).await;
    let report = orch.tick().await.expect("tick");
    assert!(matches!(report.outcomes[0].result, VisitResult::Errored { .. }));

    let agent = orch.components().agents.get("agent-0").await.expect("agent");
    assert!(agent.status.is_idle());
    assert!(agent.lease().is_none());
    assert_eq!(orch.in_flight_count().await, 0);

    // Nothing was recorded for the lost completion.
    let research = orch
        .components()
        .capabilities
        .get("market-research")
        .await
        .expect("capability");
    assert_eq!(research.usage_count, 0);
    assert_eq!(count_action(&orch, actions::TASK_COMPLETED).await, 0);
    assert_eq!(count_action(&orch, actions::TASK_CANCELLED).await, 1);
    assert_eq!(
        orch.components().store.get(opp.id).await.expect("get").stage,
        "discovery"
    );

    let report = orch.tick().await.expect("tick");
    assert_eq!(
        report.outcomes[0].result,
        VisitResult::Advanced {
            to: "analysis".to_string()
        }
    );
    let research = orch
        .components()
        .capabilities
        .get("market-research")
        .await
        .expect("capability");
    assert_eq!(research.usage_count, 1);
    assert_eq!(count_action(&orch, actions::TASK_COMPLETED).await, 1);
}

#[tokio::test]
async fn transition_entry_is_retried_after_a_transient_failure() {
    let repository = ScriptedRepository::new();
    let orch = orchestrator(repository.clone()).await;
    let opp = orch.submit(candidate()).await.expect("submit");

    repository.fail_appends(actions::OPPORTUNITY_ADVANCED, 1).await;
    let report = orch.tick().await.expect("tick");
    assert_eq!(
        report.outcomes[0].result,
        VisitResult::Advanced {
            to: "analysis".to_string()
        }
    );
    assert_eq!(count_action(&orch, actions::OPPORTUNITY_ADVANCED).await, 1);
    assert_eq!(
        orch.components().store.get(opp.id).await.expect("get").stage,
        "analysis"
    );
    assert!(orch.components().proof_log.verify_integrity().await.is_ok());
}

#[tokio::test]
async fn persistent_transition_entry_failure_is_surfaced() {
    let repository = ScriptedRepository::new();
    let orch = orchestrator(repository.clone()).await;
    let opp = orch.submit(candidate()).await.expect("submit");

    repository.fail_appends(actions::OPPORTUNITY_ADVANCED, 10).await;
    let report = orch.tick().await.expect("tick");
    assert!(matches!(report.outcomes[0].result, VisitResult::Errored { .. }));
    assert_eq!(orch.stats().await.failed_visits, 1);

    let agent = orch.components().agents.get("agent-0").await.expect("agent");
    assert!(agent.status.is_idle());
    assert_eq!(orch.in_flight_count().await, 0);

    // The stage change was committed before its entry failed.
    assert_eq!(
        orch.components().store.get(opp.id).await.expect("get").stage,
        "analysis"
    );
    assert_eq!(count_action(&orch, actions::OPPORTUNITY_ADVANCED).await, 0);
}
