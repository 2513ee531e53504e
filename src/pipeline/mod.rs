//! Pipeline orchestration.
//!
//! # Architecture
//!
//! - **Stages**: the ordered catalog and its per-stage thresholds
//! - **Scorer**: opaque scoring seam consulted by scoring stages
//! - **Orchestrator**: scheduling passes, stage visits and transitions
//! - **Runner**: background loop with graceful shutdown
//! - **Config**: configuration for all of the above
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use opportunity_forge::pipeline::{
//!     FixedScorer, PipelineComponents, PipelineConfig, PipelineOrchestrator,
//! };
//! use opportunity_forge::opportunity::OpportunityCandidate;
//!
//! let config = PipelineConfig::from_env()?;
//! let components = PipelineComponents::in_memory(&config).await?;
//! let orchestrator = Arc::new(PipelineOrchestrator::new(
//!     &config,
//!     components,
//!     Arc::new(FixedScorer::new(0.8, 0.0)),
//! ));
//!
//! orchestrator
//!     .submit(OpportunityCandidate::new("Marina studios", "Short lets", "Dubai", "scan"))
//!     .await?;
//!
//! let report = orchestrator.tick().await?;
//! println!("{} visits, {} queued", report.outcomes.len(), report.queued.len());
//! ```

pub mod config;
pub mod orchestrator;
pub mod runner;
pub mod scorer;
pub mod stages;

use std::sync::Arc;

pub use config::{CapabilitySeed, ConfigError, PipelineConfig};
pub use orchestrator::{
    DispatchReport, PipelineComponents, PipelineOrchestrator, PipelineStats, QueueReason,
    QueuedVisit, RejectReason, TickReport, VisitOutcome, VisitResult, ORCHESTRATOR_AGENT,
};
pub use runner::{PipelineRunner, RunnerError};
pub use scorer::{FixedScorer, HttpScorer, OpportunityScorer, ScorerError, StageAssessment};
pub use stages::{PipelineStage, StageCatalog, StageDefinition};

/// Builds the scorer the configuration asks for.
pub fn scorer_from_config(config: &PipelineConfig) -> Result<Arc<dyn OpportunityScorer>, ScorerError> {
    match &config.scorer_url {
        Some(url) => Ok(Arc::new(HttpScorer::new(url.clone())?)),
        None => Ok(Arc::new(FixedScorer::new(config.fallback_score, 0.0))),
    }
}
