//! Opportunity store.
//!
//! Holds every opportunity record and enforces the stage state machine:
//! a record advances forward by exactly one configured stage, may be rejected
//! from any non-terminal stage, and once rejected or validated accepts no
//! further mutation. The store never writes proof entries; pairing each
//! mutation with its audit entry is the orchestrator's job.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::Stream;
use tokio::sync::{Mutex, RwLock};
use tracing::info;
use uuid::Uuid;

use super::types::{Opportunity, OpportunityCandidate, OpportunityFilter, REJECTED_STAGE};
use crate::error::StoreError;
use crate::pipeline::stages::StageCatalog;
use crate::storage::Repository;

/// One record. `write` serializes mutations through persistence; `current`
/// is only locked long enough to read or swap the snapshot, so readers never
/// wait on the repository.
struct RecordSlot {
    write: Mutex<()>,
    current: RwLock<Opportunity>,
}

impl RecordSlot {
    fn new(opportunity: Opportunity) -> Arc<Self> {
        Arc::new(Self {
            write: Mutex::new(()),
            current: RwLock::new(opportunity),
        })
    }

    async fn snapshot(&self) -> Opportunity {
        self.current.read().await.clone()
    }
}

#[derive(Default)]
struct StoreInner {
    records: HashMap<Uuid, Arc<RecordSlot>>,
    /// Creation order, used for listings.
    order: Vec<Uuid>,
}

/// In-memory opportunity store with write-through persistence.
///
/// Mutations are serialized per record; unrelated records never contend.
pub struct OpportunityStore {
    inner: RwLock<StoreInner>,
    catalog: Arc<StageCatalog>,
    repository: Arc<dyn Repository>,
}

impl OpportunityStore {
    pub fn new(catalog: Arc<StageCatalog>, repository: Arc<dyn Repository>) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            catalog,
            repository,
        }
    }

    /// Loads persisted opportunities. Returns the number loaded.
    pub async fn hydrate(&self) -> Result<usize, StoreError> {
        let stored = self.repository.load_opportunities().await?;
        let mut inner = self.inner.write().await;
        let count = stored.len();
        for opportunity in stored {
            if opportunity.stage != REJECTED_STAGE && self.catalog.get(&opportunity.stage).is_none() {
                return Err(StoreError::UnknownStage(opportunity.stage));
            }
            let id = opportunity.id;
            if inner
                .records
                .insert(id, RecordSlot::new(opportunity))
                .is_none()
            {
                inner.order.push(id);
            }
        }
        Ok(count)
    }

    /// Creates a record in the first stage with zero score and trend.
    pub async fn create(&self, candidate: OpportunityCandidate) -> Result<Opportunity, StoreError> {
        if let Some(field) = candidate.missing_field() {
            return Err(StoreError::Validation(format!("'{}' is required", field)));
        }

        let opportunity = Opportunity {
            id: Uuid::new_v4(),
            title: candidate.title,
            description: candidate.description,
            market: candidate.market,
            score: 0.0,
            trend: 0.0,
            competition: candidate.competition.unwrap_or_default(),
            revenue_potential: candidate.revenue_potential.unwrap_or_default(),
            validated: false,
            source: candidate.source,
            discovered_at: Utc::now(),
            stage: self.catalog.first().id.clone(),
            rejection_reason: None,
        };

        self.repository.save_opportunity(&opportunity).await?;

        let mut inner = self.inner.write().await;
        inner
            .records
            .insert(opportunity.id, RecordSlot::new(opportunity.clone()));
        inner.order.push(opportunity.id);

        info!(
            opportunity_id = %opportunity.id,
            stage = %opportunity.stage,
            "Created opportunity"
        );
        Ok(opportunity)
    }

    pub async fn get(&self, id: Uuid) -> Result<Opportunity, StoreError> {
        let slot = self.slot(id).await?;
        Ok(slot.snapshot().await)
    }

    /// Moves a record to `to_stage`, which must immediately follow its
    /// current stage.
    pub async fn advance(&self, id: Uuid, to_stage: &str) -> Result<Opportunity, StoreError> {
        if self.catalog.get(to_stage).is_none() {
            return Err(StoreError::UnknownStage(to_stage.to_string()));
        }

        self.mutate(id, |record| {
            ensure_open(record, to_stage)?;
            let next = self.catalog.next_after(&record.stage).map(|s| s.id.as_str());
            if next != Some(to_stage) {
                return Err(StoreError::InvalidTransition {
                    from: record.stage.clone(),
                    to: to_stage.to_string(),
                    reason: "stages advance by exactly one position".to_string(),
                });
            }
            record.stage = to_stage.to_string();
            Ok(())
        })
        .await
    }

    /// Rejects a record. Irreversible.
    pub async fn reject(&self, id: Uuid, reason: &str) -> Result<Opportunity, StoreError> {
        self.mutate(id, |record| {
            ensure_open(record, REJECTED_STAGE)?;
            record.stage = REJECTED_STAGE.to_string();
            record.rejection_reason = Some(reason.to_string());
            Ok(())
        })
        .await
    }

    /// Replaces score and trend.
    pub async fn update_score(
        &self,
        id: Uuid,
        score: f64,
        trend: f64,
    ) -> Result<Opportunity, StoreError> {
        if !score.is_finite() || !trend.is_finite() {
            return Err(StoreError::Validation(format!(
                "score and trend must be finite (got {}, {})",
                score, trend
            )));
        }

        self.mutate(id, |record| {
            let stage = record.stage.clone();
            ensure_open(record, &stage)?;
            record.score = score;
            record.trend = trend;
            Ok(())
        })
        .await
    }

    /// Marks a record at the final stage as validated, making it terminal.
    pub async fn mark_validated(&self, id: Uuid) -> Result<Opportunity, StoreError> {
        self.mutate(id, |record| {
            ensure_open(record, "validated")?;
            if !self.catalog.is_final(&record.stage) {
                return Err(StoreError::InvalidTransition {
                    from: record.stage.clone(),
                    to: "validated".to_string(),
                    reason: "only opportunities at the final stage can be validated".to_string(),
                });
            }
            record.validated = true;
            Ok(())
        })
        .await
    }

    /// Lazily yields the records currently resident in `stage_id`.
    ///
    /// The candidate set is fixed when the stream is created; each record is
    /// re-checked when yielded, so records that left the stage meanwhile are
    /// skipped. Calling again restarts from the beginning.
    pub fn list_by_stage<'a>(
        &'a self,
        stage_id: &'a str,
    ) -> impl Stream<Item = Opportunity> + Send + 'a {
        async_stream::stream! {
            let slots: Vec<Arc<RecordSlot>> = {
                let inner = self.inner.read().await;
                inner
                    .order
                    .iter()
                    .filter_map(|id| inner.records.get(id).cloned())
                    .collect()
            };
            for slot in slots {
                let record = slot.snapshot().await;
                if record.stage == stage_id {
                    yield record;
                }
            }
        }
    }

    /// Returns the records matching `filter`, in creation order.
    pub async fn list(&self, filter: &OpportunityFilter) -> Vec<Opportunity> {
        let mut result = Vec::new();
        for slot in self.slots().await {
            let record = slot.snapshot().await;
            if filter.matches(&record) {
                result.push(record);
            }
        }
        result
    }

    /// Resident count per stage id, including `rejected`.
    pub async fn count_by_stage(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for slot in self.slots().await {
            let stage = slot.current.read().await.stage.clone();
            *counts.entry(stage).or_insert(0) += 1;
        }
        counts
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.order.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn catalog(&self) -> &Arc<StageCatalog> {
        &self.catalog
    }

    async fn mutate<F>(&self, id: Uuid, apply: F) -> Result<Opportunity, StoreError>
    where
        F: FnOnce(&mut Opportunity) -> Result<(), StoreError>,
    {
        let slot = self.slot(id).await?;
        let _write = slot.write.lock().await;

        let mut updated = slot.snapshot().await;
        apply(&mut updated)?;
        self.repository.save_opportunity(&updated).await?;

        *slot.current.write().await = updated.clone();
        Ok(updated)
    }

    async fn slot(&self, id: Uuid) -> Result<Arc<RecordSlot>, StoreError> {
        self.inner
            .read()
            .await
            .records
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn slots(&self) -> Vec<Arc<RecordSlot>> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.records.get(id).cloned())
            .collect()
    }
}

fn ensure_open(record: &Opportunity, to: &str) -> Result<(), StoreError> {
    let reason = if record.is_rejected() {
        "opportunity was rejected"
    } else if record.validated {
        "opportunity is already validated"
    } else {
        return Ok(());
    };
    Err(StoreError::InvalidTransition {
        from: record.stage.clone(),
        to: to.to_string(),
        reason: reason.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opportunity::Competition;
    use crate::storage::MemoryRepository;
    use futures::StreamExt;

    fn store() -> OpportunityStore {
        OpportunityStore::new(
            Arc::new(StageCatalog::default()),
            Arc::new(MemoryRepository::new()),
        )
    }

    fn candidate(title: &str) -> OpportunityCandidate {
        OpportunityCandidate::new(title, "Furnished short lets", "Dubai", "listing-scan")
    }

    #[tokio::test]
    async fn test_create_sets_initial_state() {
        let store = store();
        let created = store
            .create(candidate("Marina studios").with_competition(Competition::High))
            .await
            .expect("create");

        assert_eq!(created.stage, "discovery");
        assert_eq!(created.score, 0.0);
        assert_eq!(created.trend, 0.0);
        assert!(!created.validated);
        assert_eq!(created.competition, Competition::High);
        assert_eq!(store.get(created.id).await.expect("get"), created);
    }

    #[tokio::test]
    async fn test_create_requires_fields() {
        let store = store();
        let err = store
            .create(OpportunityCandidate::new("", "d", "m", "s"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
    }

    #[tokio::test]
    async fn test_advance_forward_only_by_one() {
        let store = store();
        let opp = store.create(candidate("JVC flats")).await.expect("create");

        let skip = store.advance(opp.id, "validation").await.unwrap_err();
        assert!(matches!(skip, StoreError::InvalidTransition { .. }));

        store.advance(opp.id, "analysis").await.expect("advance");
        let back = store.advance(opp.id, "discovery").await.unwrap_err();
        assert!(matches!(back, StoreError::InvalidTransition { .. }));

        let same = store.advance(opp.id, "analysis").await.unwrap_err();
        assert!(matches!(same, StoreError::InvalidTransition { .. }));

        assert!(matches!(
            store.advance(opp.id, "launch").await,
            Err(StoreError::UnknownStage(_))
        ));
        assert_eq!(store.get(opp.id).await.expect("get").stage, "analysis");
    }

    #[tokio::test]
    async fn test_rejected_records_are_frozen() {
        let store = store();
        let opp = store.create(candidate("Old town villas")).await.expect("create");
        let rejected = store.reject(opp.id, "duplicate listing").await.expect("reject");
        assert_eq!(rejected.stage, REJECTED_STAGE);
        assert_eq!(rejected.rejection_reason.as_deref(), Some("duplicate listing"));

        assert!(store.advance(opp.id, "analysis").await.is_err());
        assert!(store.update_score(opp.id, 0.9, 0.1).await.is_err());
        assert!(store.reject(opp.id, "again").await.is_err());
        assert!(store.mark_validated(opp.id).await.is_err());
    }

    #[tokio::test]
    async fn test_mark_validated_only_at_final_stage() {
        let store = store();
        let opp = store.create(candidate("Palm penthouses")).await.expect("create");
        assert!(store.mark_validated(opp.id).await.is_err());

        store.advance(opp.id, "analysis").await.expect("advance");
        store.advance(opp.id, "validation").await.expect("advance");
        let validated = store.mark_validated(opp.id).await.expect("validate");
        assert!(validated.validated);
        assert!(validated.is_terminal());
        assert!(store.update_score(opp.id, 0.1, 0.0).await.is_err());
    }

    #[tokio::test]
    async fn test_update_score_rejects_non_finite() {
        let store = store();
        let opp = store.create(candidate("Downtown lofts")).await.expect("create");
        assert!(matches!(
            store.update_score(opp.id, f64::NAN, 0.0).await,
            Err(StoreError::Validation(_))
        ));
        let scored = store.update_score(opp.id, 0.72, -0.05).await.expect("score");
        assert_eq!(scored.score, 0.72);
        assert_eq!(scored.trend, -0.05);
    }

    #[tokio::test]
    async fn test_list_by_stage_is_restartable() {
        let store = store();
        let a = store.create(candidate("A")).await.expect("create");
        store.create(candidate("B")).await.expect("create");
        store.advance(a.id, "analysis").await.expect("advance");

        let discovery: Vec<Opportunity> = store.list_by_stage("discovery").collect().await;
        assert_eq!(discovery.len(), 1);
        assert_eq!(discovery[0].title, "B");

        let again: Vec<Opportunity> = store.list_by_stage("discovery").collect().await;
        assert_eq!(discovery, again);

        let counts = store.count_by_stage().await;
        assert_eq!(counts.get("analysis"), Some(&1));
        assert_eq!(counts.get("discovery"), Some(&1));
    }

    #[tokio::test]
    async fn test_list_filter_and_hydrate() {
        let repository = Arc::new(MemoryRepository::new());
        let catalog = Arc::new(StageCatalog::default());
        let store = OpportunityStore::new(catalog.clone(), repository.clone());
        let a = store.create(candidate("A")).await.expect("create");
        store.create(candidate("B")).await.expect("create");
        store.reject(a.id, "manual").await.expect("reject");

        let rejected = store
            .list(&OpportunityFilter::new().with_stage(REJECTED_STAGE))
            .await;
        assert_eq!(rejected.len(), 1);

        let reloaded = OpportunityStore::new(catalog, repository);
        assert_eq!(reloaded.hydrate().await.expect("hydrate"), 2);
        let all = reloaded.list(&OpportunityFilter::default()).await;
        assert_eq!(all.iter().map(|o| o.title.as_str()).collect::<Vec<_>>(), vec!["A", "B"]);
        assert!(all[0].is_rejected());
    }

    /// Repository whose next opportunity write parks until released.
    #[derive(Default)]
    struct HeldWrites {
        inner: MemoryRepository,
        armed: std::sync::atomic::AtomicBool,
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl Repository for HeldWrites {
        async fn save_opportunity(
            &self,
            opportunity: &Opportunity,
        ) -> Result<(), crate::storage::RepositoryError> {
            if self.armed.swap(false, std::sync::atomic::Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.save_opportunity(opportunity).await
        }

        async fn load_opportunities(
            &self,
        ) -> Result<Vec<Opportunity>, crate::storage::RepositoryError> {
            self.inner.load_opportunities().await
        }

        async fn save_capability(
            &self,
            capability: &crate::capability::Capability,
        ) -> Result<(), crate::storage::RepositoryError> {
            self.inner.save_capability(capability).await
        }

        async fn load_capabilities(
            &self,
        ) -> Result<Vec<crate::capability::Capability>, crate::storage::RepositoryError> {
            self.inner.load_capabilities().await
        }

        async fn append_proof(
            &self,
            record: &crate::proof::ProofRecord,
        ) -> Result<(), crate::storage::RepositoryError> {
            self.inner.append_proof(record).await
        }

        async fn mark_proof_verified(&self, id: Uuid) -> Result<(), crate::storage::RepositoryError> {
            self.inner.mark_proof_verified(id).await
        }

        async fn load_proof(
            &self,
        ) -> Result<Vec<crate::proof::ProofRecord>, crate::storage::RepositoryError> {
            self.inner.load_proof().await
        }

        async fn ping(&self) -> Result<(), crate::storage::RepositoryError> {
            self.inner.ping().await
        }
    }

    #[tokio::test]
    async fn test_readers_do_not_wait_on_a_slow_write() {
        let repository = Arc::new(HeldWrites::default());
        let store = Arc::new(OpportunityStore::new(
            Arc::new(StageCatalog::default()),
            repository.clone(),
        ));
        let id = store.create(candidate("A")).await.expect("create").id;
        store.create(candidate("B")).await.expect("create");

        repository.armed.store(true, std::sync::atomic::Ordering::SeqCst);
        let writer = {
            let store = store.clone();
            tokio::spawn(async move { store.advance(id, "analysis").await })
        };
        repository.entered.notified().await;

        let listed: Vec<Opportunity> = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            store.list_by_stage("discovery").collect(),
        )
        .await
        .expect("listing must not wait for the pending write");
        assert_eq!(listed.len(), 2);

        let pending = tokio::time::timeout(std::time::Duration::from_secs(1), store.get(id))
            .await
            .expect("get must not wait for the pending write")
            .expect("get");
        assert_eq!(pending.stage, "discovery");

        repository.release.notify_one();
        let advanced = writer.await.expect("join").expect("advance");
        assert_eq!(advanced.stage, "analysis");
        assert_eq!(store.get(id).await.expect("get").stage, "analysis");
    }

    #[tokio::test]
    async fn test_concurrent_mutations_of_one_record_serialize() {
        let store = Arc::new(store());
        let id = store.create(candidate("Serial")).await.expect("create").id;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.advance(id, "analysis").await }));
        }
        let mut advanced = 0;
        for handle in handles {
            if handle.await.expect("join").is_ok() {
                advanced += 1;
            }
        }
        assert_eq!(advanced, 1);
        assert_eq!(store.get(id).await.expect("get").stage, "analysis");
    }
}
