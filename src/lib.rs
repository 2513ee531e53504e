//! opportunity-forge: staged opportunity discovery with an auditable trail.
//!
//! Candidate business opportunities move through an ordered set of stages.
//! Agents execute each stage visit when a capability of the stage's category
//! is trusted enough, capability confidence learns from task outcomes, and
//! every transition lands in an append-only, hash-chained proof log.

// Core modules
pub mod agent;
pub mod capability;
pub mod error;
pub mod opportunity;
pub mod pipeline;
pub mod proof;
pub mod storage;

// Surfaces
pub mod api;
pub mod cli;
pub mod client;
pub mod metrics;

// Re-export commonly used error types
pub use error::{AgentError, CapabilityError, OrchestratorError, ProofLogError, StoreError};
