//! HTTP client for the opportunity-forge API.
//!
//! Used by the CLI subcommands that talk to a running server, and by the
//! integration tests.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::agent::AiStatus;
use crate::api::routes::{ErrorBody, HealthResponse, VerifyResponse};
use crate::capability::Capability;
use crate::opportunity::{Opportunity, OpportunityCandidate, OpportunityFilter};
use crate::pipeline::{PipelineStage, PipelineStats};
use crate::proof::MetaProofEntry;

/// Default request timeout.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Errors returned by [`ApiClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("API error ({status}): {message}")]
    Api {
        status: u16,
        message: String,
        body: Option<ErrorBody>,
    },
}

impl ClientError {
    /// HTTP status of an API error, if this is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            ClientError::Request(e) => e.status().map(|s| s.as_u16()),
        }
    }
}

#[derive(Serialize)]
struct RejectBody<'a> {
    reason: &'a str,
}

#[derive(Serialize)]
struct CancelBody<'a> {
    reason: &'a str,
}

#[derive(Serialize)]
struct ProofQuery {
    from: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    to: Option<u64>,
}

/// Typed client for the `/api` routes.
#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    /// Creates a client for the server at `base_url`.
    ///
    /// Both `http://host:port` and `http://host:port/api` are accepted.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        let base_url = base_url.into();
        let base_url = base_url.trim_end_matches('/');
        let base_url = base_url.strip_suffix("/api").unwrap_or(base_url).to_string();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            base_url,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self) -> Result<HealthResponse, ClientError> {
        self.get_json("/api/health").await
    }

    pub async fn fetch_opportunities(
        &self,
        filter: &OpportunityFilter,
    ) -> Result<Vec<Opportunity>, ClientError> {
        let response = self
            .client
            .get(self.url("/api/opportunities"))
            .query(filter)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn create_opportunity(
        &self,
        candidate: &OpportunityCandidate,
    ) -> Result<Opportunity, ClientError> {
        let response = self
            .client
            .post(self.url("/api/opportunities"))
            .json(candidate)
            .send()
            .await?;
        decode(response).await
    }

    pub async fn get_opportunity(&self, id: Uuid) -> Result<Opportunity, ClientError> {
        self.get_json(&format!("/api/opportunities/{}", id)).await
    }

    pub async fn reject_opportunity(
        &self,
        id: Uuid,
        reason: &str,
    ) -> Result<Opportunity, ClientError> {
        let response = self
            .client
            .post(self.url(&format!("/api/opportunities/{}/reject", id)))
            .json(&RejectBody { reason })
            .send()
            .await?;
        decode(response).await
    }

    /// Proof entries in positions `[from, to)`; an unset `to` reads to the end.
    pub async fn proof_range(
        &self,
        from: u64,
        to: Option<u64>,
    ) -> Result<Vec<MetaProofEntry>, ClientError> {
        let response = self
            .client
            .get(self.url("/api/proof"))
            .query(&ProofQuery { from, to })
            .send()
            .await?;
        decode(response).await
    }

    pub async fn verify_proof(&self, id: Uuid) -> Result<VerifyResponse, ClientError> {
        let response = self
            .client
            .post(self.url(&format!("/api/proof/{}/verify", id)))
            .send()
            .await?;
        decode(response).await
    }

    pub async fn stages(&self) -> Result<Vec<PipelineStage>, ClientError> {
        self.get_json("/api/stages").await
    }

    pub async fn stats(&self) -> Result<PipelineStats, ClientError> {
        self.get_json("/api/stats").await
    }

    pub async fn agents(&self) -> Result<Vec<AiStatus>, ClientError> {
        self.get_json("/api/agents").await
    }

    pub async fn cancel_agent(&self, agent_id: &str, reason: &str) -> Result<AiStatus, ClientError> {
        let response = self
            .client
            .post(self.url(&format!("/api/agents/{}/cancel", agent_id)))
            .json(&CancelBody { reason })
            .send()
            .await?;
        decode(response).await
    }

    pub async fn capabilities(&self) -> Result<Vec<Capability>, ClientError> {
        self.get_json("/api/capabilities").await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let response = self.client.get(self.url(path)).send().await?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let text = response.text().await.unwrap_or_default();
    let body: Option<ErrorBody> = serde_json::from_str(&text).ok();
    let message = body
        .as_ref()
        .map(|b| b.message.clone())
        .unwrap_or(text);
    Err(ClientError::Api {
        status: status.as_u16(),
        message,
        body,
    })
}
