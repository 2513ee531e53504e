//! HTTP API exercised through the typed client.

use std::sync::Arc;

use opportunity_forge::api::routes::ErrorKind;
use opportunity_forge::api::{self, AppState};
use opportunity_forge::client::{ApiClient, ClientError};
use opportunity_forge::opportunity::{OpportunityCandidate, OpportunityFilter};
use opportunity_forge::pipeline::{
    FixedScorer, PipelineComponents, PipelineConfig, PipelineOrchestrator,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use uuid::Uuid;

struct TestServer {
    client: ApiClient,
    orchestrator: Arc<PipelineOrchestrator>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl TestServer {
    async fn start() -> Self {
        let config = PipelineConfig::default();
        let components = PipelineComponents::in_memory(&config)
            .await
            .expect("components");
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            &config,
            components,
            Arc::new(FixedScorer::new(0.8, 0.1)),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("local addr");
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(api::serve(
            listener,
            AppState::new(Arc::clone(&orchestrator)),
            async move {
                let _ = rx.await;
            },
        ));

        Self {
            client: ApiClient::new(format!("http://{}", address)).expect("client"),
            orchestrator,
            shutdown: Some(tx),
            handle,
        }
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.handle.await.expect("server task").expect("server result");
    }
}

fn api_kind(err: &ClientError) -> Option<ErrorKind> {
    match err {
        ClientError::Api { body, .. } => body.as_ref().map(|b| b.error),
        ClientError::Request(_) => None,
    }
}

fn candidate(title: &str) -> OpportunityCandidate {
    OpportunityCandidate::new(title, "Furnished short lets", "Dubai", "listing-scan")
}

#[tokio::test]
async fn health_reports_version() {
    let server = TestServer::start().await;
    let health = server.client.health().await.expect("health");
    assert_eq!(health.status, "healthy");
    assert_eq!(health.version, env!("CARGO_PKG_VERSION"));
    server.stop().await;
}

#[tokio::test]
async fn opportunities_can_be_created_listed_and_rejected() {
    let server = TestServer::start().await;
    let client = &server.client;

    let created = client
        .create_opportunity(&candidate("Marina studios"))
        .await
        .expect("create");
    assert_eq!(created.stage, "discovery");
    client
        .create_opportunity(&candidate("Souk kiosks"))
        .await
        .expect("create");

    let fetched = client.get_opportunity(created.id).await.expect("get");
    assert_eq!(fetched, created);

    let all = client
        .fetch_opportunities(&OpportunityFilter::new())
        .await
        .expect("list");
    assert_eq!(all.len(), 2);

    let in_discovery = client
        .fetch_opportunities(&OpportunityFilter::new().with_stage("discovery"))
        .await
        .expect("list");
    assert_eq!(in_discovery.len(), 2);
    let validated = client
        .fetch_opportunities(&OpportunityFilter::new().with_validated(true))
        .await
        .expect("list");
    assert!(validated.is_empty());

    let rejected = client
        .reject_opportunity(created.id, "duplicate listing")
        .await
        .expect("reject");
    assert_eq!(rejected.rejection_reason.as_deref(), Some("duplicate listing"));

    let err = client
        .reject_opportunity(created.id, "again")
        .await
        .expect_err("terminal");
    assert_eq!(err.status(), Some(409));
    assert_eq!(api_kind(&err), Some(ErrorKind::InvalidTransition));

    let stages = client.stages().await.expect("stages");
    assert_eq!(stages.len(), 3);
    assert_eq!(stages[0].id, "discovery");
    assert_eq!(stages[0].opportunities, 1);

    server.stop().await;
}

#[tokio::test]
async fn invalid_requests_map_to_typed_errors() {
    let server = TestServer::start().await;
    let client = &server.client;

    let err = client
        .create_opportunity(&OpportunityCandidate::new("", "desc", "Dubai", "scan"))
        .await
        .expect_err("blank title");
    assert_eq!(err.status(), Some(422));
    assert_eq!(api_kind(&err), Some(ErrorKind::Validation));

    let err = client
        .get_opportunity(Uuid::new_v4())
        .await
        .expect_err("unknown id");
    assert_eq!(err.status(), Some(404));
    assert_eq!(api_kind(&err), Some(ErrorKind::NotFound));

    let err = client
        .cancel_agent("agent-0", "nothing to cancel")
        .await
        .expect_err("idle agent");
    assert_eq!(err.status(), Some(409));
    assert_eq!(api_kind(&err), Some(ErrorKind::AgentState));

    let err = client
        .verify_proof(Uuid::new_v4())
        .await
        .expect_err("unknown proof entry");
    assert_eq!(err.status(), Some(404));

    server.stop().await;
}

#[tokio::test]
async fn proof_log_is_readable_and_verifiable() {
    let server = TestServer::start().await;
    let client = &server.client;

    client
        .create_opportunity(&candidate("Marina studios"))
        .await
        .expect("create");
    server.orchestrator.tick().await.expect("tick");

    let entries = client.proof_range(1, None).await.expect("proof");
    assert!(entries.len() >= 3);
    assert_eq!(entries[0].action, "opportunity.created");
    assert!(entries.iter().all(|e| !e.verified));

    let window = client.proof_range(2, Some(3)).await.expect("proof window");
    assert_eq!(window.len(), 1);
    assert_eq!(window[0].id, entries[1].id);

    let first = client.verify_proof(entries[0].id).await.expect("verify");
    assert!(first.newly_verified);
    assert!(first.entry.verified);
    let again = client.verify_proof(entries[0].id).await.expect("verify again");
    assert!(!again.newly_verified);

    let agents = client.agents().await.expect("agents");
    assert_eq!(agents.len(), 3);
    let capabilities = client.capabilities().await.expect("capabilities");
    assert_eq!(capabilities.len(), 3);
    let stats = client.stats().await.expect("stats");
    assert_eq!(stats.submitted, 1);
    assert_eq!(stats.advanced, 1);

    server.stop().await;
}
