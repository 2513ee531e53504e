//! Stage catalog.
//!
//! The ordered list of stages an opportunity passes through, fixed at
//! start-up. Each definition carries the orchestration parameters for its
//! stage: which capability category executes it, the minimum confidence an
//! eligible capability needs, whether the stage re-scores the opportunity and
//! the score an opportunity needs to leave it.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::config::ConfigError;
use crate::capability::CapabilityCategory;
use crate::opportunity::REJECTED_STAGE;

/// Configured stage with its orchestration parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Presentation hint passed through to listings.
    #[serde(default = "default_color")]
    pub color: String,
    /// Capability category required to execute the stage.
    pub category: CapabilityCategory,
    #[serde(default)]
    pub min_confidence: f64,
    /// Whether visiting the stage re-evaluates the score.
    #[serde(default)]
    pub scoring: bool,
    /// Score needed to leave the stage; lower scores are rejected.
    #[serde(default)]
    pub score_floor: f64,
}

fn default_color() -> String {
    "slate".to_string()
}

impl StageDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>, category: CapabilityCategory) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            color: default_color(),
            category,
            min_confidence: 0.0,
            scoring: false,
            score_floor: 0.0,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = color.into();
        self
    }

    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    /// Marks the stage as scoring, with the given floor.
    pub fn scoring(mut self, score_floor: f64) -> Self {
        self.scoring = true;
        self.score_floor = score_floor;
        self
    }
}

/// Stage view exposed to listings. `opportunities` is derived on every read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStage {
    pub id: String,
    pub name: String,
    pub description: String,
    pub opportunities: usize,
    pub color: String,
}

/// Ordered, validated set of stages.
#[derive(Debug, Clone)]
pub struct StageCatalog {
    stages: Vec<StageDefinition>,
}

impl StageCatalog {
    /// Builds a catalog, rejecting empty lists, duplicate or reserved ids and
    /// thresholds outside `[0, 1]`.
    pub fn new(stages: Vec<StageDefinition>) -> Result<Self, ConfigError> {
        if stages.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one stage must be configured".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for stage in &stages {
            if stage.id.trim().is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "stage id cannot be empty".to_string(),
                ));
            }
            if stage.id == REJECTED_STAGE {
                return Err(ConfigError::ValidationFailed(format!(
                    "stage id '{}' is reserved",
                    REJECTED_STAGE
                )));
            }
            if !seen.insert(stage.id.as_str()) {
                return Err(ConfigError::ValidationFailed(format!(
                    "duplicate stage id '{}'",
                    stage.id
                )));
            }
            if !(0.0..=1.0).contains(&stage.min_confidence) {
                return Err(ConfigError::ValidationFailed(format!(
                    "stage '{}': min_confidence must be between 0.0 and 1.0",
                    stage.id
                )));
            }
            if !(0.0..=1.0).contains(&stage.score_floor) {
                return Err(ConfigError::ValidationFailed(format!(
                    "stage '{}': score_floor must be between 0.0 and 1.0",
                    stage.id
                )));
            }
        }

        Ok(Self { stages })
    }

    /// The default three-stage catalog.
    pub fn default_stages() -> Vec<StageDefinition> {
        vec![
            StageDefinition::new("discovery", "Discovery", CapabilityCategory::Research)
                .with_description("Candidates surfaced by market scanning")
                .with_color("blue")
                .with_min_confidence(0.5),
            StageDefinition::new("analysis", "Analysis", CapabilityCategory::Analysis)
                .with_description("Market sizing, trend and competition scoring")
                .with_color("amber")
                .with_min_confidence(0.5)
                .scoring(0.3),
            StageDefinition::new("validation", "Validation", CapabilityCategory::Operations)
                .with_description("Feasibility checks before an opportunity is marked validated")
                .with_color("green")
                .with_min_confidence(0.6)
                .scoring(0.6),
        ]
    }

    /// The entry stage.
    pub fn first(&self) -> &StageDefinition {
        &self.stages[0]
    }

    pub fn get(&self, id: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.id == id)
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.id == id)
    }

    /// The stage immediately after `id`, if any.
    pub fn next_after(&self, id: &str) -> Option<&StageDefinition> {
        self.index_of(id).and_then(|idx| self.stages.get(idx + 1))
    }

    /// Whether `id` is the last configured stage.
    pub fn is_final(&self, id: &str) -> bool {
        self.stages.last().is_some_and(|s| s.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StageDefinition> {
        self.stages.iter()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Builds the listing view from resident counts.
    pub fn view(&self, counts: &HashMap<String, usize>) -> Vec<PipelineStage> {
        self.stages
            .iter()
            .map(|s| PipelineStage {
                id: s.id.clone(),
                name: s.name.clone(),
                description: s.description.clone(),
                opportunities: counts.get(&s.id).copied().unwrap_or(0),
                color: s.color.clone(),
            })
            .collect()
    }
}

impl Default for StageCatalog {
    fn default() -> Self {
        Self {
            stages: Self::default_stages(),
        }
    }
}
