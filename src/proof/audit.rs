//! Optional audit pass over the proof log.
//!
//! Verification is never part of the write path. An audit walks a range of
//! the log, first recomputing the digest chain, then asking a
//! [`ProofVerifier`] to confirm each unverified entry and flipping the flag
//! of every entry it confirms.

use std::collections::HashSet;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::{MetaProofEntry, ProofLog};
use crate::error::ProofLogError;

/// Independent check for a proof entry.
#[async_trait]
pub trait ProofVerifier: Send + Sync {
    /// Returns `true` if the entry is confirmed.
    async fn confirm(&self, entry: &MetaProofEntry) -> bool;
}

/// Confirms entries written by a known set of agents.
#[derive(Debug, Clone, Default)]
pub struct KnownAgentVerifier {
    agents: HashSet<String>,
}

impl KnownAgentVerifier {
    pub fn new<I, S>(agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            agents: agents.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl ProofVerifier for KnownAgentVerifier {
    async fn confirm(&self, entry: &MetaProofEntry) -> bool {
        self.agents.contains(&entry.agent)
    }
}

/// Outcome of an audit pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditReport {
    pub examined: usize,
    pub newly_verified: usize,
    pub already_verified: usize,
    /// Entries the verifier declined to confirm.
    pub unconfirmed: Vec<Uuid>,
}

/// Audits the entries with positions in `[from, to)`.
///
/// Fails with `ProofLogError::IntegrityViolation` before touching any flag if
/// the digest chain does not recompute.
pub async fn run_audit(
    log: &ProofLog,
    verifier: &dyn ProofVerifier,
    from: u64,
    to: u64,
) -> Result<AuditReport, ProofLogError> {
    log.verify_integrity().await?;

    let entries: Vec<MetaProofEntry> = log.range(from, to).collect().await;
    let mut report = AuditReport {
        examined: entries.len(),
        ..AuditReport::default()
    };

    for entry in entries {
        if entry.verified {
            report.already_verified += 1;
            continue;
        }
        if !verifier.confirm(&entry).await {
            report.unconfirmed.push(entry.id);
            continue;
        }
        if log.verify(entry.id).await? {
            report.newly_verified += 1;
        } else {
            report.already_verified += 1;
        }
    }

    info!(
        examined = report.examined,
        newly_verified = report.newly_verified,
        unconfirmed = report.unconfirmed.len(),
        "Proof audit finished"
    );
    Ok(report)
}
