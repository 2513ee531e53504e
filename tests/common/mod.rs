//! Repository wrapper for fault and interleaving scenarios.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use opportunity_forge::capability::Capability;
use opportunity_forge::opportunity::Opportunity;
use opportunity_forge::proof::ProofRecord;
use opportunity_forge::storage::{MemoryRepository, Repository, RepositoryError};
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

/// In-memory repository whose proof appends can be failed or paused by
/// action name.
#[derive(Default)]
pub struct ScriptedRepository {
    inner: MemoryRepository,
    failures: Mutex<HashMap<String, u32>>,
    hold: Mutex<Option<String>>,
    /// Signalled when a paused append is reached.
    pub held: Notify,
    /// Lets a paused append continue.
    pub release: Notify,
}

impl ScriptedRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fails the next `times` appends of `action`.
    pub async fn fail_appends(&self, action: &str, times: u32) {
        self.failures.lock().await.insert(action.to_string(), times);
    }

    /// Pauses the next append of `action` until `release` is notified.
    pub async fn hold_next_append(&self, action: &str) {
        *self.hold.lock().await = Some(action.to_string());
    }
}

#[async_trait]
impl Repository for ScriptedRepository {
    async fn save_opportunity(&self, opportunity: &Opportunity) -> Result<(), RepositoryError> {
        self.inner.save_opportunity(opportunity).await
    }

    async fn load_opportunities(&self) -> Result<Vec<Opportunity>, RepositoryError> {
        self.inner.load_opportunities().await
    }

    async fn save_capability(&self, capability: &Capability) -> Result<(), RepositoryError> {
        self.inner.save_capability(capability).await
    }

    async fn load_capabilities(&self) -> Result<Vec<Capability>, RepositoryError> {
        self.inner.load_capabilities().await
    }

    async fn append_proof(&self, record: &ProofRecord) -> Result<(), RepositoryError> {
        let action = record.entry.action.as_str();
        {
            let mut failures = self.failures.lock().await;
            if let Some(remaining) = failures.get_mut(action) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(RepositoryError::ConnectionFailed(format!(
                        "injected failure for {}",
                        action
                    )));
                }
            }
        }

        let pause = {
            let mut hold = self.hold.lock().await;
            if hold.as_deref() == Some(action) {
                hold.take();
                true
            } else {
                false
            }
        };
        if pause {
            self.held.notify_one();
            self.release.notified().await;
        }

        self.inner.append_proof(record).await
    }

    async fn mark_proof_verified(&self, id: Uuid) -> Result<(), RepositoryError> {
        self.inner.mark_proof_verified(id).await
    }

    async fn load_proof(&self) -> Result<Vec<ProofRecord>, RepositoryError> {
        self.inner.load_proof().await
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        self.inner.ping().await
    }
}
