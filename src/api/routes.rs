//! API handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::AppState;
use crate::agent::AiStatus;
use crate::capability::Capability;
use crate::error::{AgentError, OrchestratorError, ProofLogError, StoreError};
use crate::opportunity::{Opportunity, OpportunityCandidate, OpportunityFilter};
use crate::pipeline::{PipelineStage, PipelineStats};
use crate::proof::MetaProofEntry;

// === Errors ===

/// Error category reported to API clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Validation,
    InvalidTransition,
    AgentState,
    Conflict,
    Internal,
}

/// Error response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorKind,
    pub message: String,
}

/// Handler error, rendered as [`ErrorBody`].
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: ErrorKind,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let message = err.to_string();
        let (status, kind) = match &err {
            OrchestratorError::Store(StoreError::NotFound(_))
            | OrchestratorError::Agent(AgentError::NotFound(_))
            | OrchestratorError::ProofLog(ProofLogError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, ErrorKind::NotFound)
            }
            OrchestratorError::Store(StoreError::Validation(_))
            | OrchestratorError::Store(StoreError::UnknownStage(_)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, ErrorKind::Validation)
            }
            OrchestratorError::Store(StoreError::InvalidTransition { .. }) => {
                (StatusCode::CONFLICT, ErrorKind::InvalidTransition)
            }
            OrchestratorError::Agent(AgentError::AgentBusy { .. })
            | OrchestratorError::Agent(AgentError::NoActiveTask(_))
            | OrchestratorError::Agent(AgentError::TaskSuperseded { .. })
            | OrchestratorError::Agent(AgentError::InvalidState { .. })
            | OrchestratorError::NoAssignment(_) => (StatusCode::CONFLICT, ErrorKind::AgentState),
            OrchestratorError::InFlight(_) => (StatusCode::CONFLICT, ErrorKind::Conflict),
            _ => {
                tracing::error!(error = %err, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, ErrorKind::Internal)
            }
        };
        Self::new(status, kind, message)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        OrchestratorError::from(err).into()
    }
}

impl From<ProofLogError> for ApiError {
    fn from(err: ProofLogError) -> Self {
        OrchestratorError::from(err).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.kind,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// === Health ===

/// Health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

/// GET /api/health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = match state.orchestrator.components().repository.ping().await {
        Ok(()) => "healthy",
        Err(e) => {
            tracing::warn!(error = %e, "Storage ping failed");
            "degraded"
        }
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
    })
}

// === Opportunities ===

/// GET /api/opportunities?stage=&validated=
pub async fn list_opportunities(
    State(state): State<AppState>,
    Query(filter): Query<OpportunityFilter>,
) -> Json<Vec<Opportunity>> {
    Json(state.orchestrator.components().store.list(&filter).await)
}

/// POST /api/opportunities
pub async fn create_opportunity(
    State(state): State<AppState>,
    Json(candidate): Json<OpportunityCandidate>,
) -> ApiResult<(StatusCode, Json<Opportunity>)> {
    let opportunity = state.orchestrator.submit(candidate).await?;
    Ok((StatusCode::CREATED, Json(opportunity)))
}

/// GET /api/opportunities/:id
pub async fn get_opportunity(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Opportunity>> {
    Ok(Json(state.orchestrator.components().store.get(id).await?))
}

#[derive(Debug, Deserialize)]
pub struct RejectRequest {
    pub reason: String,
}

/// POST /api/opportunities/:id/reject
pub async fn reject_opportunity(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<RejectRequest>,
) -> ApiResult<Json<Opportunity>> {
    if request.reason.trim().is_empty() {
        return Err(ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::Validation,
            "reason cannot be empty",
        ));
    }
    Ok(Json(state.orchestrator.reject(id, &request.reason).await?))
}

// === Pipeline ===

/// GET /api/stages
pub async fn list_stages(State(state): State<AppState>) -> Json<Vec<PipelineStage>> {
    Json(state.orchestrator.stages().await)
}

/// GET /api/stats
pub async fn stats(State(state): State<AppState>) -> Json<PipelineStats> {
    Json(state.orchestrator.stats().await)
}

/// GET /api/agents
pub async fn list_agents(State(state): State<AppState>) -> Json<Vec<AiStatus>> {
    Json(state.orchestrator.components().agents.list().await)
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// POST /api/agents/:id/cancel
pub async fn cancel_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    request: Option<Json<CancelRequest>>,
) -> ApiResult<Json<AiStatus>> {
    let reason = request
        .and_then(|Json(r)| r.reason)
        .unwrap_or_else(|| "cancelled by operator".to_string());
    Ok(Json(state.orchestrator.cancel_agent(&agent_id, &reason).await?))
}

/// GET /api/capabilities
pub async fn list_capabilities(State(state): State<AppState>) -> Json<Vec<Capability>> {
    Json(state.orchestrator.components().capabilities.list().await)
}

// === Proof log ===

#[derive(Debug, Default, Deserialize)]
pub struct ProofRangeQuery {
    #[serde(default)]
    pub from: Option<u64>,
    #[serde(default)]
    pub to: Option<u64>,
}

/// GET /api/proof?from=&to=
///
/// Positions are 1-based and the range is half-open.
pub async fn proof_range(
    State(state): State<AppState>,
    Query(query): Query<ProofRangeQuery>,
) -> Json<Vec<MetaProofEntry>> {
    let from = query.from.unwrap_or(1);
    let to = query.to.unwrap_or(u64::MAX);
    let entries = state
        .orchestrator
        .components()
        .proof_log
        .range(from, to)
        .collect()
        .await;
    Json(entries)
}

/// Verification response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyResponse {
    /// Whether this request flipped the flag.
    pub newly_verified: bool,
    pub entry: MetaProofEntry,
}

/// POST /api/proof/:id/verify
pub async fn verify_proof(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<VerifyResponse>> {
    let proof_log = &state.orchestrator.components().proof_log;
    let newly_verified = proof_log.verify(id).await?;
    let entry = proof_log.get(id).await?;
    Ok(Json(VerifyResponse {
        newly_verified,
        entry,
    }))
}
