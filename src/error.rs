//! Error types for opportunity-forge operations.
//!
//! Defines the error taxonomy for every core subsystem:
//! - Capability registry lookups and confidence updates
//! - Proof log ordering and verification
//! - Opportunity store transitions
//! - Agent status machine misuse
//! - Orchestration failures that wrap the above
//!
//! Backpressure (no eligible capability or idle agent) is deliberately absent:
//! it is a normal queueing condition reported through
//! [`crate::pipeline::QueueReason`], not a failure.

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::storage::RepositoryError;

/// Errors that can occur during capability registry operations.
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("Capability '{0}' not found")]
    NotFound(String),

    #[error("Capability '{0}' is already registered")]
    Duplicate(String),

    #[error("Invalid confidence {value} for capability '{id}': must be within [0, 1]")]
    InvalidConfidence { id: String, value: f64 },

    #[error("Storage error: {0}")]
    Storage(#[from] RepositoryError),
}

/// Errors that can occur while appending to or verifying the proof log.
#[derive(Debug, Error)]
pub enum ProofLogError {
    #[error("Proof entry {0} not found")]
    NotFound(Uuid),

    #[error("Proof entry {0} already exists in the log")]
    DuplicateEntry(Uuid),

    #[error("Out of order append: timestamp {timestamp} precedes last entry at {last}")]
    OutOfOrder {
        timestamp: DateTime<Utc>,
        last: DateTime<Utc>,
    },

    #[error("Proof chain broken at position {position}")]
    IntegrityViolation { position: u64 },

    #[error("Storage error: {0}")]
    Storage(#[from] RepositoryError),
}

/// Errors that can occur during opportunity store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Opportunity {0} not found")]
    NotFound(Uuid),

    #[error("Stage '{0}' is not configured")]
    UnknownStage(String),

    #[error("Invalid stage transition from '{from}' to '{to}': {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Invalid opportunity: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(#[from] RepositoryError),
}

/// Errors that can occur when driving an agent's status machine.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent '{0}' not found")]
    NotFound(String),

    #[error("Agent '{0}' is already registered")]
    Duplicate(String),

    #[error("Agent '{agent_id}' is busy ({status})")]
    AgentBusy { agent_id: String, status: String },

    #[error("Agent '{0}' has no active task")]
    NoActiveTask(String),

    /// The agent finished or was reassigned since the task was claimed.
    #[error("Agent '{agent_id}' no longer runs task {task_id}")]
    TaskSuperseded { agent_id: String, task_id: Uuid },

    #[error("Agent '{agent_id}' cannot {operation} while {status}")]
    InvalidState {
        agent_id: String,
        status: String,
        operation: String,
    },

    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),

    #[error("Proof log error: {0}")]
    ProofLog(#[from] ProofLogError),
}

/// Errors surfaced by the pipeline orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),

    #[error("Proof log error: {0}")]
    ProofLog(#[from] ProofLogError),

    #[error("Storage error: {0}")]
    Storage(#[from] RepositoryError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::pipeline::ConfigError),

    #[error("Opportunity {0} already has a stage operation in flight")]
    InFlight(Uuid),

    #[error("No task in flight for agent '{0}'")]
    NoAssignment(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::InvalidTransition {
            from: "discovery".to_string(),
            to: "validation".to_string(),
            reason: "stages cannot be skipped".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("discovery"));
        assert!(msg.contains("validation"));
        assert!(msg.contains("skipped"));
    }

    #[test]
    fn test_agent_error_display() {
        let err = AgentError::AgentBusy {
            agent_id: "agent-0".to_string(),
            status: "researching".to_string(),
        };
        assert!(err.to_string().contains("busy"));
        assert!(err.to_string().contains("researching"));

        let err = AgentError::InvalidState {
            agent_id: "agent-1".to_string(),
            status: "thinking".to_string(),
            operation: "complete task".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Agent 'agent-1' cannot complete task while thinking"
        );
    }

    #[test]
    fn test_orchestrator_error_wraps_sources() {
        let err: OrchestratorError = CapabilityError::NotFound("market-research".to_string()).into();
        assert!(err.to_string().contains("market-research"));

        let err: OrchestratorError = AgentError::NoActiveTask("agent-2".to_string()).into();
        assert!(err.to_string().contains("no active task"));
    }
}
