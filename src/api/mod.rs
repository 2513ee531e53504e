//! HTTP surface.
//!
//! A thin adapter over the orchestrator: every handler validates its input,
//! calls one orchestrator or store operation and serializes the result. All
//! routes live under `/api` except the Prometheus scrape endpoint.

pub mod routes;

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tracing::info;

use crate::pipeline::PipelineOrchestrator;

/// State shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<PipelineOrchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<PipelineOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

/// Create the API router.
pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(routes::health))
        .route(
            "/opportunities",
            get(routes::list_opportunities).post(routes::create_opportunity),
        )
        .route("/opportunities/:id", get(routes::get_opportunity))
        .route("/opportunities/:id/reject", post(routes::reject_opportunity))
        .route("/stages", get(routes::list_stages))
        .route("/agents", get(routes::list_agents))
        .route("/agents/:id/cancel", post(routes::cancel_agent))
        .route("/capabilities", get(routes::list_capabilities))
        .route("/proof", get(routes::proof_range))
        .route("/proof/:id/verify", post(routes::verify_proof))
        .route("/stats", get(routes::stats));

    Router::new()
        .nest("/api", api)
        .route("/metrics", get(crate::metrics::metrics_handler))
        .with_state(state)
}

/// Serves the API on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let address = listener.local_addr()?;
    info!(address = %address, "API server listening");
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
