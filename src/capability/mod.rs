//! Capability registry.
//!
//! Tracks the named capabilities agents have learned (market research, deal
//! drafting, ...), each with a confidence score in `[0, 1]` and a usage
//! counter. The orchestrator consults [`CapabilityRegistry::eligible`] to decide
//! whether a stage can be executed at all.
//!
//! Confidence only moves through [`CapabilityRegistry::record_usage`], which
//! applies a bounded exponential moving average:
//!
//! ```text
//! confidence' = clamp(confidence + alpha * (outcome - confidence), 0, 1)
//! ```
//!
//! where `outcome` is `1.0` on success and `0.0` on failure.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::error::CapabilityError;
use crate::storage::Repository;

/// Default smoothing constant for confidence updates.
pub const DEFAULT_CONFIDENCE_ALPHA: f64 = 0.1;

/// Broad area a capability belongs to. Stages require one category each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityCategory {
    Research,
    Analysis,
    Development,
    Marketing,
    Operations,
}

impl std::fmt::Display for CapabilityCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapabilityCategory::Research => write!(f, "research"),
            CapabilityCategory::Analysis => write!(f, "analysis"),
            CapabilityCategory::Development => write!(f, "development"),
            CapabilityCategory::Marketing => write!(f, "marketing"),
            CapabilityCategory::Operations => write!(f, "operations"),
        }
    }
}

/// A learned capability and how much the pipeline currently trusts it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub id: String,
    pub name: String,
    pub category: CapabilityCategory,
    /// Trust in `[0, 1]`, moved only by the usage feedback rule.
    pub confidence: f64,
    pub learned_at: DateTime<Utc>,
    pub usage_count: u64,
}

impl Capability {
    /// Creates a capability learned now, with no recorded usage.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        category: CapabilityCategory,
        confidence: f64,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            category,
            confidence,
            learned_at: Utc::now(),
            usage_count: 0,
        }
    }

    /// Applies one usage outcome to this capability.
    fn apply_usage(&mut self, success: bool, alpha: f64) {
        let outcome = if success { 1.0 } else { 0.0 };
        let updated = self.confidence + alpha * (outcome - self.confidence);
        self.confidence = updated.clamp(0.0, 1.0);
        self.usage_count = self.usage_count.saturating_add(1);
    }
}

/// Registry of capabilities.
///
/// Reads share the outer map lock; each capability sits behind its own mutex
/// so confidence updates are serialized per capability id only.
pub struct CapabilityRegistry {
    capabilities: RwLock<HashMap<String, Arc<Mutex<Capability>>>>,
    alpha: f64,
    repository: Arc<dyn Repository>,
}

impl CapabilityRegistry {
    /// Creates an empty registry using the given smoothing constant.
    pub fn new(alpha: f64, repository: Arc<dyn Repository>) -> Self {
        Self {
            capabilities: RwLock::new(HashMap::new()),
            alpha,
            repository,
        }
    }

    /// Loads previously persisted capabilities into the registry.
    ///
    /// Returns the number of capabilities loaded.
    pub async fn hydrate(&self) -> Result<usize, CapabilityError> {
        let stored = self.repository.load_capabilities().await?;
        let mut map = self.capabilities.write().await;
        let count = stored.len();
        for capability in stored {
            map.insert(capability.id.clone(), Arc::new(Mutex::new(capability)));
        }
        Ok(count)
    }

    /// Registers a new capability.
    ///
    /// # Errors
    ///
    /// Returns `CapabilityError::Duplicate` if the id is taken and
    /// `CapabilityError::InvalidConfidence` if confidence is outside `[0, 1]`.
    pub async fn register(&self, capability: Capability) -> Result<(), CapabilityError> {
        if !(0.0..=1.0).contains(&capability.confidence) {
            return Err(CapabilityError::InvalidConfidence {
                id: capability.id,
                value: capability.confidence,
            });
        }

        let mut map = self.capabilities.write().await;
        if map.contains_key(&capability.id) {
            return Err(CapabilityError::Duplicate(capability.id));
        }

        self.repository.save_capability(&capability).await?;
        map.insert(capability.id.clone(), Arc::new(Mutex::new(capability)));
        Ok(())
    }

    /// Returns a snapshot of the capability with the given id.
    pub async fn get(&self, id: &str) -> Result<Capability, CapabilityError> {
        let slot = self.slot(id).await?;
        let capability = slot.lock().await;
        Ok(capability.clone())
    }

    /// Records one use of a capability and updates its confidence.
    ///
    /// `usage_count` is incremented regardless of the outcome.
    pub async fn record_usage(&self, id: &str, success: bool) -> Result<Capability, CapabilityError> {
        let slot = self.slot(id).await?;
        let mut capability = slot.lock().await;

        let mut updated = capability.clone();
        updated.apply_usage(success, self.alpha);
        self.repository.save_capability(&updated).await?;

        debug!(
            capability_id = %id,
            success,
            confidence = updated.confidence,
            usage_count = updated.usage_count,
            "Recorded capability usage"
        );

        *capability = updated.clone();
        Ok(updated)
    }

    /// Returns the capabilities in `category` whose confidence is at least
    /// `min_confidence`, most confident first.
    pub async fn eligible(
        &self,
        category: CapabilityCategory,
        min_confidence: f64,
    ) -> Vec<Capability> {
        let mut eligible = Vec::new();
        for capability in self.list().await {
            if capability.category == category && capability.confidence >= min_confidence {
                eligible.push(capability);
            }
        }
        eligible.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.id.cmp(&b.id))
        });
        eligible
    }

    /// Returns all capabilities ordered by id.
    pub async fn list(&self) -> Vec<Capability> {
        let slots: Vec<Arc<Mutex<Capability>>> =
            self.capabilities.read().await.values().cloned().collect();

        let mut capabilities = Vec::with_capacity(slots.len());
        for slot in slots {
            capabilities.push(slot.lock().await.clone());
        }
        capabilities.sort_by(|a, b| a.id.cmp(&b.id));
        capabilities
    }

    /// Smoothing constant used for confidence updates.
    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    async fn slot(&self, id: &str) -> Result<Arc<Mutex<Capability>>, CapabilityError> {
        self.capabilities
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CapabilityError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryRepository;

    fn registry() -> CapabilityRegistry {
        CapabilityRegistry::new(DEFAULT_CONFIDENCE_ALPHA, Arc::new(MemoryRepository::new()))
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = registry();
        registry
            .register(Capability::new(
                "market-research",
                "Market research",
                CapabilityCategory::Research,
                0.7,
            ))
            .await
            .expect("register should succeed");

        let capability = registry.get("market-research").await.expect("should exist");
        assert_eq!(capability.name, "Market research");
        assert_eq!(capability.usage_count, 0);
        assert!(matches!(
            registry.get("unknown").await,
            Err(CapabilityError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_register_rejects_duplicates_and_bad_confidence() {
        let registry = registry();
        let cap = Capability::new("deal-drafting", "Deal drafting", CapabilityCategory::Operations, 0.5);
        registry.register(cap.clone()).await.expect("first register");
        assert!(matches!(
            registry.register(cap).await,
            Err(CapabilityError::Duplicate(_))
        ));

        let bad = Capability::new("overconfident", "Overconfident", CapabilityCategory::Analysis, 1.5);
        assert!(matches!(
            registry.register(bad).await,
            Err(CapabilityError::InvalidConfidence { .. })
        ));
    }

    #[tokio::test]
    async fn test_record_usage_moves_confidence_by_ema() {
        let registry = registry();
        registry
            .register(Capability::new("scoring", "Scoring", CapabilityCategory::Analysis, 0.5))
            .await
            .expect("register");

        let after_success = registry.record_usage("scoring", true).await.expect("usage");
        assert!((after_success.confidence - 0.55).abs() < 1e-9);
        assert_eq!(after_success.usage_count, 1);

        let after_failure = registry.record_usage("scoring", false).await.expect("usage");
        assert!((after_failure.confidence - 0.495).abs() < 1e-9);
        assert_eq!(after_failure.usage_count, 2);
    }

    #[tokio::test]
    async fn test_record_usage_unknown_capability() {
        let registry = registry();
        assert!(matches!(
            registry.record_usage("ghost", true).await,
            Err(CapabilityError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_confidence_stays_bounded() {
        let registry = CapabilityRegistry::new(1.0, Arc::new(MemoryRepository::new()));
        registry
            .register(Capability::new("edge", "Edge", CapabilityCategory::Marketing, 1.0))
            .await
            .expect("register");

        // Alternate long runs of successes and failures with the most aggressive alpha.
        for round in 0..200u32 {
            let success = (round / 7) % 2 == 0;
            let cap = registry.record_usage("edge", success).await.expect("usage");
            assert!((0.0..=1.0).contains(&cap.confidence));
        }

        let cap = registry.get("edge").await.expect("exists");
        assert_eq!(cap.usage_count, 200);
    }

    #[tokio::test]
    async fn test_eligible_filters_and_orders() {
        let registry = registry();
        for (id, category, confidence) in [
            ("a", CapabilityCategory::Research, 0.4),
            ("b", CapabilityCategory::Research, 0.9),
            ("c", CapabilityCategory::Research, 0.6),
            ("d", CapabilityCategory::Analysis, 0.95),
        ] {
            registry
                .register(Capability::new(id, id, category, confidence))
                .await
                .expect("register");
        }

        let eligible = registry.eligible(CapabilityCategory::Research, 0.6).await;
        let ids: Vec<&str> = eligible.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);

        assert!(registry
            .eligible(CapabilityCategory::Development, 0.0)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_usage_persists_through_repository() {
        let repository = Arc::new(MemoryRepository::new());
        let registry = CapabilityRegistry::new(0.5, repository.clone());
        registry
            .register(Capability::new("persisted", "Persisted", CapabilityCategory::Research, 0.2))
            .await
            .expect("register");
        registry.record_usage("persisted", true).await.expect("usage");

        let reloaded = CapabilityRegistry::new(0.5, repository);
        assert_eq!(reloaded.hydrate().await.expect("hydrate"), 1);
        let cap = reloaded.get("persisted").await.expect("exists");
        assert_eq!(cap.usage_count, 1);
        assert!((cap.confidence - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_category_display_matches_serde() {
        for category in [
            CapabilityCategory::Research,
            CapabilityCategory::Analysis,
            CapabilityCategory::Development,
            CapabilityCategory::Marketing,
            CapabilityCategory::Operations,
        ] {
            let json = serde_json::to_string(&category).expect("serialize");
            assert_eq!(json, format!("\"{}\"", category));
        }
    }
}
