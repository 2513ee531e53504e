//! Repository seam between the in-memory stores and durable storage.
//!
//! The stores keep their working state in memory and write every committed
//! mutation through a [`Repository`] before exposing it. The persistence
//! technology behind the trait is irrelevant to the pipeline: tests and
//! ephemeral runs use [`MemoryRepository`], deployments use
//! [`super::SqliteRepository`].

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::capability::Capability;
use crate::opportunity::Opportunity;
use crate::proof::ProofRecord;

/// Errors that can occur while reading or writing the backing store.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Connection to the backing store failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] super::migrations::MigrationError),

    /// A stored row could not be mapped back to a domain record.
    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    /// A proof record referenced by id does not exist.
    #[error("Proof record {0} not found")]
    ProofNotFound(Uuid),
}

/// Durable storage for opportunities, capabilities and proof records.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Inserts or replaces an opportunity.
    async fn save_opportunity(&self, opportunity: &Opportunity) -> Result<(), RepositoryError>;

    /// Loads every stored opportunity, oldest first.
    async fn load_opportunities(&self) -> Result<Vec<Opportunity>, RepositoryError>;

    /// Inserts or replaces a capability.
    async fn save_capability(&self, capability: &Capability) -> Result<(), RepositoryError>;

    /// Loads every stored capability.
    async fn load_capabilities(&self) -> Result<Vec<Capability>, RepositoryError>;

    /// Appends a proof record. Positions are never rewritten.
    async fn append_proof(&self, record: &ProofRecord) -> Result<(), RepositoryError>;

    /// Flips the `verified` flag of a stored proof record.
    async fn mark_proof_verified(&self, id: Uuid) -> Result<(), RepositoryError>;

    /// Loads every proof record ordered by position.
    async fn load_proof(&self) -> Result<Vec<ProofRecord>, RepositoryError>;

    /// Checks that the backing store is reachable.
    async fn ping(&self) -> Result<(), RepositoryError>;
}

/// Repository that keeps everything in process memory.
#[derive(Default)]
pub struct MemoryRepository {
    opportunities: RwLock<Vec<Opportunity>>,
    capabilities: RwLock<HashMap<String, Capability>>,
    proof: RwLock<BTreeMap<u64, ProofRecord>>,
}

impl MemoryRepository {
    /// Creates an empty in-memory repository.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn save_opportunity(&self, opportunity: &Opportunity) -> Result<(), RepositoryError> {
        let mut opportunities = self.opportunities.write().await;
        match opportunities.iter_mut().find(|o| o.id == opportunity.id) {
            Some(existing) => *existing = opportunity.clone(),
            None => opportunities.push(opportunity.clone()),
        }
        Ok(())
    }

    async fn load_opportunities(&self) -> Result<Vec<Opportunity>, RepositoryError> {
        Ok(self.opportunities.read().await.clone())
    }

    async fn save_capability(&self, capability: &Capability) -> Result<(), RepositoryError> {
        self.capabilities
            .write()
            .await
            .insert(capability.id.clone(), capability.clone());
        Ok(())
    }

    async fn load_capabilities(&self) -> Result<Vec<Capability>, RepositoryError> {
        Ok(self.capabilities.read().await.values().cloned().collect())
    }

    async fn append_proof(&self, record: &ProofRecord) -> Result<(), RepositoryError> {
        let mut proof = self.proof.write().await;
        if proof.contains_key(&record.position) {
            return Err(RepositoryError::InvalidData(format!(
                "proof position {} already written",
                record.position
            )));
        }
        proof.insert(record.position, record.clone());
        Ok(())
    }

    async fn mark_proof_verified(&self, id: Uuid) -> Result<(), RepositoryError> {
        let mut proof = self.proof.write().await;
        let record = proof
            .values_mut()
            .find(|r| r.entry.id == id)
            .ok_or(RepositoryError::ProofNotFound(id))?;
        record.entry.verified = true;
        Ok(())
    }

    async fn load_proof(&self) -> Result<Vec<ProofRecord>, RepositoryError> {
        Ok(self.proof.read().await.values().cloned().collect())
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}
