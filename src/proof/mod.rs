//! Append-only proof log.
//!
//! Every consequential action in the pipeline is recorded here as a
//! [`MetaProofEntry`]: what was done, by which agent, with what result, and
//! whether an independent check has confirmed it.
//!
//! # Ordering
//!
//! The log is the single ordering authority of the system. All appends go
//! through one write lock, which assigns strictly increasing positions
//! (starting at 1) and enforces non-decreasing timestamps. What happens to an
//! entry whose timestamp precedes the previous one is configured explicitly
//! through [`TimestampPolicy`]; nothing is corrected silently.
//!
//! # Integrity
//!
//! Each stored [`ProofRecord`] carries a SHA-256 digest chained over the
//! previous record's digest and the immutable fields of its entry, so
//! reordering, deletion or rewriting of past entries is detectable through
//! [`ProofLog::verify_integrity`]. The `verified` flag is excluded from the
//! digest because [`ProofLog::verify`] is the one permitted post-append
//! mutation.

pub mod audit;

pub use audit::{run_audit, AuditReport, KnownAgentVerifier, ProofVerifier};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ProofLogError;
use crate::metrics;
use crate::storage::Repository;

/// Action names written by the pipeline.
pub mod actions {
    pub const OPPORTUNITY_CREATED: &str = "opportunity.created";
    pub const OPPORTUNITY_SCORED: &str = "opportunity.scored";
    pub const OPPORTUNITY_ADVANCED: &str = "opportunity.advanced";
    pub const OPPORTUNITY_VALIDATED: &str = "opportunity.validated";
    pub const OPPORTUNITY_REJECTED: &str = "opportunity.rejected";
    pub const TASK_COMPLETED: &str = "agent.task_completed";
    pub const TASK_FAILED: &str = "agent.task_failed";
    pub const TASK_CANCELLED: &str = "agent.cancelled";
}

/// A single audit entry. This is the exact exported field set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaProofEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub agent: String,
    pub result: String,
    pub verified: bool,
}

impl MetaProofEntry {
    /// Creates an unverified entry stamped with the current time.
    pub fn new(
        action: impl Into<String>,
        agent: impl Into<String>,
        result: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            action: action.into(),
            agent: agent.into(),
            result: result.into(),
            verified: false,
        }
    }

    /// Overrides the entry timestamp.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// An entry as stored in the log, with its position and chain digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofRecord {
    pub position: u64,
    pub entry: MetaProofEntry,
    /// Hex-encoded SHA-256 over the previous digest and this entry.
    pub digest: String,
}

/// What `append` does with an entry older than the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampPolicy {
    /// Fail the append with `ProofLogError::OutOfOrder`.
    #[default]
    Reject,
    /// Raise the timestamp to the previous entry's and log a warning.
    Clamp,
}

/// Position and id of an appended entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProofReceipt {
    pub position: u64,
    pub id: Uuid,
}

#[derive(Default)]
struct LogInner {
    records: Vec<ProofRecord>,
    index: HashMap<Uuid, usize>,
}

/// The append-only proof log.
pub struct ProofLog {
    inner: RwLock<LogInner>,
    policy: TimestampPolicy,
    repository: Arc<dyn Repository>,
}

impl ProofLog {
    /// Creates an empty log.
    pub fn new(policy: TimestampPolicy, repository: Arc<dyn Repository>) -> Self {
        Self {
            inner: RwLock::new(LogInner::default()),
            policy,
            repository,
        }
    }

    /// Loads the persisted log and checks its digest chain.
    ///
    /// Returns the number of records loaded.
    pub async fn hydrate(&self) -> Result<usize, ProofLogError> {
        let mut stored = self.repository.load_proof().await?;
        stored.sort_by_key(|r| r.position);
        check_chain(&stored)?;

        let mut inner = self.inner.write().await;
        inner.index = stored
            .iter()
            .enumerate()
            .map(|(idx, r)| (r.entry.id, idx))
            .collect();
        inner.records = stored;
        Ok(inner.records.len())
    }

    /// Appends an entry and returns its position.
    ///
    /// # Errors
    ///
    /// - `ProofLogError::DuplicateEntry` if the entry id was already appended
    /// - `ProofLogError::OutOfOrder` if the timestamp precedes the previous
    ///   entry and the policy is [`TimestampPolicy::Reject`]
    /// - `ProofLogError::Storage` if the write-through fails; the in-memory
    ///   log is left untouched in that case
    pub async fn append(&self, entry: MetaProofEntry) -> Result<u64, ProofLogError> {
        let mut inner = self.inner.write().await;
        self.append_locked(&mut inner, entry).await
    }

    /// Appends an entry stamped inside the ordering lock.
    ///
    /// The timestamp is the later of "now" and the previous entry's timestamp,
    /// so this path never fails with `OutOfOrder`.
    pub async fn record(
        &self,
        action: &str,
        agent: &str,
        result: impl Into<String>,
    ) -> Result<ProofReceipt, ProofLogError> {
        let mut inner = self.inner.write().await;
        let mut entry = MetaProofEntry::new(action, agent, result);
        if let Some(last) = inner.records.last() {
            entry.timestamp = entry.timestamp.max(last.entry.timestamp);
        }
        let id = entry.id;
        let position = self.append_locked(&mut inner, entry).await?;
        Ok(ProofReceipt { position, id })
    }

    async fn append_locked(
        &self,
        inner: &mut LogInner,
        mut entry: MetaProofEntry,
    ) -> Result<u64, ProofLogError> {
        if inner.index.contains_key(&entry.id) {
            return Err(ProofLogError::DuplicateEntry(entry.id));
        }

        let previous = inner.records.last();
        if let Some(last) = previous {
            if entry.timestamp < last.entry.timestamp {
                match self.policy {
                    TimestampPolicy::Reject => {
                        return Err(ProofLogError::OutOfOrder {
                            timestamp: entry.timestamp,
                            last: last.entry.timestamp,
                        });
                    }
                    TimestampPolicy::Clamp => {
                        warn!(
                            entry_id = %entry.id,
                            submitted = %entry.timestamp,
                            corrected = %last.entry.timestamp,
                            "Clamping out-of-order proof timestamp"
                        );
                        entry.timestamp = last.entry.timestamp;
                    }
                }
            }
        }

        let position = inner.records.len() as u64 + 1;
        let previous_digest = previous.map(|r| r.digest.as_str()).unwrap_or("");
        let digest = chain_digest(previous_digest, position, &entry);
        let record = ProofRecord {
            position,
            entry,
            digest,
        };

        self.repository.append_proof(&record).await?;

        debug!(
            position,
            action = %record.entry.action,
            agent = %record.entry.agent,
            "Appended proof entry"
        );
        metrics::record_proof_append(&record.entry.action);

        inner.index.insert(record.entry.id, inner.records.len());
        inner.records.push(record);
        Ok(position)
    }

    /// Marks an entry as independently verified.
    ///
    /// Returns `true` if this call flipped the flag and `false` if the entry
    /// was already verified. Re-verification is a no-op, not an error.
    pub async fn verify(&self, id: Uuid) -> Result<bool, ProofLogError> {
        let mut inner = self.inner.write().await;
        let idx = *inner.index.get(&id).ok_or(ProofLogError::NotFound(id))?;
        if inner.records[idx].entry.verified {
            return Ok(false);
        }

        self.repository.mark_proof_verified(id).await?;
        inner.records[idx].entry.verified = true;
        Ok(true)
    }

    /// Returns the entry with the given id.
    pub async fn get(&self, id: Uuid) -> Result<MetaProofEntry, ProofLogError> {
        let inner = self.inner.read().await;
        let idx = *inner.index.get(&id).ok_or(ProofLogError::NotFound(id))?;
        Ok(inner.records[idx].entry.clone())
    }

    /// Number of entries in the log.
    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    /// Whether the log is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Position of the most recent entry, or 0 for an empty log.
    pub async fn last_position(&self) -> u64 {
        self.inner.read().await.records.len() as u64
    }

    /// Lazily yields entries with positions in `[from, to)`.
    ///
    /// The upper bound is fixed when the stream is created, so entries
    /// appended during traversal are not included and the stream always
    /// terminates. Calling `range` again restarts the traversal.
    pub fn range(&self, from: u64, to: u64) -> impl Stream<Item = MetaProofEntry> + Send + '_ {
        async_stream::stream! {
            let end = {
                let inner = self.inner.read().await;
                to.min(inner.records.len() as u64 + 1)
            };
            let mut position = from.max(1);
            while position < end {
                let entry = {
                    let inner = self.inner.read().await;
                    inner.records.get((position - 1) as usize).map(|r| r.entry.clone())
                };
                match entry {
                    Some(entry) => yield entry,
                    None => break,
                }
                position += 1;
            }
        }
    }

    /// Returns the stored records with positions in `[from, to)`.
    pub async fn records(&self, from: u64, to: u64) -> Vec<ProofRecord> {
        let inner = self.inner.read().await;
        inner
            .records
            .iter()
            .filter(|r| r.position >= from && r.position < to)
            .cloned()
            .collect()
    }

    /// Recomputes the digest chain over the whole log.
    pub async fn verify_integrity(&self) -> Result<(), ProofLogError> {
        let inner = self.inner.read().await;
        check_chain(&inner.records)
    }

    /// Timestamp policy in force.
    pub fn policy(&self) -> TimestampPolicy {
        self.policy
    }
}

fn chain_digest(previous: &str, position: u64, entry: &MetaProofEntry) -> String {
    let mut hasher = Sha256::new();
    for field in [
        previous.as_bytes(),
        &position.to_be_bytes(),
        entry.id.as_bytes(),
        entry.timestamp.to_rfc3339().as_bytes(),
        entry.action.as_bytes(),
        entry.agent.as_bytes(),
        entry.result.as_bytes(),
    ] {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field);
    }
    hex::encode(hasher.finalize())
}

fn check_chain(records: &[ProofRecord]) -> Result<(), ProofLogError> {
    let mut previous = "";
    let mut last_timestamp: Option<DateTime<Utc>> = None;
    for (idx, record) in records.iter().enumerate() {
        let expected_position = idx as u64 + 1;
        let out_of_order = last_timestamp.is_some_and(|t| record.entry.timestamp < t);
        if record.position != expected_position
            || out_of_order
            || chain_digest(previous, record.position, &record.entry) != record.digest
        {
            return Err(ProofLogError::IntegrityViolation {
                position: record.position,
            });
        }
        previous = &record.digest;
        last_timestamp = Some(record.entry.timestamp);
    }
    Ok(())
}
