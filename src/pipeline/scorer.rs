//! Scoring seam.
//!
//! How an opportunity is scored is opaque to the pipeline: a stage visit
//! hands the record to an [`OpportunityScorer`] and acts on the returned
//! [`StageAssessment`]. A failed assessment counts as a failed task.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::stages::StageDefinition;
use crate::opportunity::Opportunity;

/// Errors returned by scorers.
#[derive(Debug, Error)]
pub enum ScorerError {
    #[error("Scorer request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Scorer returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid assessment: {0}")]
    InvalidAssessment(String),

    #[error("Scoring failed: {0}")]
    Failed(String),
}

/// Result of scoring an opportunity at one stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageAssessment {
    pub score: f64,
    pub trend: f64,
}

impl StageAssessment {
    pub fn new(score: f64, trend: f64) -> Self {
        Self { score, trend }
    }

    /// Rejects non-finite scores or trends.
    pub fn validate(self) -> Result<Self, ScorerError> {
        if !self.score.is_finite() || !self.trend.is_finite() {
            return Err(ScorerError::InvalidAssessment(format!(
                "non-finite score {} / trend {}",
                self.score, self.trend
            )));
        }
        Ok(self)
    }
}

/// Scores opportunities during stage visits.
#[async_trait]
pub trait OpportunityScorer: Send + Sync {
    async fn assess(
        &self,
        opportunity: &Opportunity,
        stage: &StageDefinition,
    ) -> Result<StageAssessment, ScorerError>;
}

/// Returns the same assessment for every opportunity.
#[derive(Debug, Clone, Copy)]
pub struct FixedScorer {
    assessment: StageAssessment,
}

impl FixedScorer {
    pub fn new(score: f64, trend: f64) -> Self {
        Self {
            assessment: StageAssessment::new(score, trend),
        }
    }
}

#[async_trait]
impl OpportunityScorer for FixedScorer {
    async fn assess(
        &self,
        _opportunity: &Opportunity,
        _stage: &StageDefinition,
    ) -> Result<StageAssessment, ScorerError> {
        self.assessment.validate()
    }
}

#[derive(Serialize)]
struct AssessRequest<'a> {
    stage: &'a str,
    opportunity: &'a Opportunity,
}

/// Scorer backed by a remote HTTP service.
///
/// POSTs `{ "stage": ..., "opportunity": {...} }` to the configured URL and
/// expects `{ "score": ..., "trend": ... }` back.
pub struct HttpScorer {
    client: reqwest::Client,
    url: String,
}

impl HttpScorer {
    pub fn new(url: impl Into<String>) -> Result<Self, ScorerError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl OpportunityScorer for HttpScorer {
    async fn assess(
        &self,
        opportunity: &Opportunity,
        stage: &StageDefinition,
    ) -> Result<StageAssessment, ScorerError> {
        let response = self
            .client
            .post(&self.url)
            .json(&AssessRequest {
                stage: &stage.id,
                opportunity,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ScorerError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let assessment: StageAssessment = response.json().await?;
        assessment.validate()
    }
}
