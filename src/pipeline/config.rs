//! Pipeline configuration.
//!
//! Covers the stage catalog and its thresholds, retry and confidence
//! parameters, proof log timestamp policy, agent pool size, scheduling
//! cadence, storage and collaborator endpoints.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::stages::{StageCatalog, StageDefinition};
use crate::capability::{Capability, CapabilityCategory, DEFAULT_CONFIDENCE_ALPHA};
use crate::proof::TimestampPolicy;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// The configuration file could not be parsed.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability registered at start-up unless already persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySeed {
    pub id: String,
    pub name: String,
    pub category: CapabilityCategory,
    pub confidence: f64,
}

impl CapabilitySeed {
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
        }
    }

    pub fn to_capability(&self) -> Capability {
        Capability::new(self.id.clone(), self.name.clone(), self.category, self.confidence)
    }
}

/// Configuration for the pipeline and its HTTP surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Base URL clients use to reach the API.
    pub api_base_url: String,
    /// Address the HTTP server binds to.
    pub bind_address: String,
    /// SQLite URL; in-memory storage when unset.
    pub database_url: Option<String>,

    /// Ordered stage catalog with per-stage thresholds.
    pub stages: Vec<StageDefinition>,
    pub capabilities: Vec<CapabilitySeed>,

    /// Consecutive failures tolerated at one stage before rejection.
    pub max_retries: u32,
    /// Smoothing constant of the confidence update rule.
    pub confidence_alpha: f64,
    pub timestamp_policy: TimestampPolicy,

    pub num_agents: usize,
    pub tick_interval_ms: u64,
    /// Deadline for a single stage visit; no deadline when unset.
    pub task_deadline_secs: Option<u64>,
    pub shutdown_timeout_secs: u64,

    /// Remote scorer endpoint; the fixed fallback score is used when unset.
    pub scorer_url: Option<String>,
    pub fallback_score: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000/api".to_string(),
            bind_address: "127.0.0.1:8000".to_string(),
            database_url: None,

            stages: StageCatalog::default_stages(),
            capabilities: vec![
                CapabilitySeed::new("market-research", "Market research", CapabilityCategory::Research, 0.7),
                CapabilitySeed::new("trend-analysis", "Trend analysis", CapabilityCategory::Analysis, 0.7),
                CapabilitySeed::new(
                    "feasibility-review",
                    "Feasibility review",
                    CapabilityCategory::Operations,
                    0.7,
                ),
            ],

            max_retries: 3,
            confidence_alpha: DEFAULT_CONFIDENCE_ALPHA,
            timestamp_policy: TimestampPolicy::Reject,

            num_agents: 3,
            tick_interval_ms: 1000,
            task_deadline_secs: None,
            shutdown_timeout_secs: 30,

            scorer_url: None,
            fallback_score: 0.7,
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables on top of the defaults.
    ///
    /// # Environment Variables
    ///
    /// - `OPPORTUNITY_API_BASE_URL`: API base URL (default: http://localhost:8000/api)
    /// - `OPPORTUNITY_BIND_ADDRESS`: HTTP bind address (default: 127.0.0.1:8000)
    /// - `DATABASE_URL`: SQLite URL (default: in-memory)
    /// - `OPPORTUNITY_MAX_RETRIES`: Failures tolerated per stage (default: 3)
    /// - `OPPORTUNITY_CONFIDENCE_ALPHA`: EMA smoothing constant (default: 0.1)
    /// - `OPPORTUNITY_TIMESTAMP_POLICY`: `reject` or `clamp` (default: reject)
    /// - `OPPORTUNITY_NUM_AGENTS`: Agent pool size (default: 3)
    /// - `OPPORTUNITY_TICK_INTERVAL_MS`: Scheduling interval (default: 1000)
    /// - `OPPORTUNITY_TASK_DEADLINE_SECS`: Per-visit deadline (default: none)
    /// - `OPPORTUNITY_SCORER_URL`: Remote scorer endpoint (default: none)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Loads a YAML configuration file. Missing fields take default values.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies overrides from `lookup`, then validates.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("OPPORTUNITY_API_BASE_URL") {
            self.api_base_url = val;
        }

        if let Some(val) = lookup("OPPORTUNITY_BIND_ADDRESS") {
            self.bind_address = val;
        }

        if let Some(val) = lookup("DATABASE_URL") {
            self.database_url = Some(val);
        }

        if let Some(val) = lookup("OPPORTUNITY_MAX_RETRIES") {
            self.max_retries = parse_env_value(&val, "OPPORTUNITY_MAX_RETRIES")?;
        }

        if let Some(val) = lookup("OPPORTUNITY_CONFIDENCE_ALPHA") {
            self.confidence_alpha = parse_env_value(&val, "OPPORTUNITY_CONFIDENCE_ALPHA")?;
        }

        if let Some(val) = lookup("OPPORTUNITY_TIMESTAMP_POLICY") {
            self.timestamp_policy = parse_timestamp_policy(&val)?;
        }

        if let Some(val) = lookup("OPPORTUNITY_NUM_AGENTS") {
            self.num_agents = parse_env_value(&val, "OPPORTUNITY_NUM_AGENTS")?;
        }

        if let Some(val) = lookup("OPPORTUNITY_TICK_INTERVAL_MS") {
            self.tick_interval_ms = parse_env_value(&val, "OPPORTUNITY_TICK_INTERVAL_MS")?;
        }

        if let Some(val) = lookup("OPPORTUNITY_TASK_DEADLINE_SECS") {
            self.task_deadline_secs = Some(parse_env_value(&val, "OPPORTUNITY_TASK_DEADLINE_SECS")?);
        }

        if let Some(val) = lookup("OPPORTUNITY_SCORER_URL") {
            self.scorer_url = Some(val);
        }

        self.validate()?;
        Ok(self)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        StageCatalog::new(self.stages.clone())?;

        if !(self.confidence_alpha > 0.0 && self.confidence_alpha <= 1.0) {
            return Err(ConfigError::ValidationFailed(
                "confidence_alpha must be in (0.0, 1.0]".to_string(),
            ));
        }

        if self.num_agents == 0 {
            return Err(ConfigError::ValidationFailed(
                "num_agents must be greater than 0".to_string(),
            ));
        }

        if self.tick_interval_ms == 0 {
            return Err(ConfigError::ValidationFailed(
                "tick_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.task_deadline_secs == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "task_deadline_secs must be greater than 0 when set".to_string(),
            ));
        }

        if self.bind_address.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "bind_address cannot be empty".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.fallback_score) {
            return Err(ConfigError::ValidationFailed(
                "fallback_score must be between 0.0 and 1.0".to_string(),
            ));
        }

        for seed in &self.capabilities {
            if !(0.0..=1.0).contains(&seed.confidence) {
                return Err(ConfigError::ValidationFailed(format!(
                    "capability '{}': confidence must be between 0.0 and 1.0",
                    seed.id
                )));
            }
        }

        Ok(())
    }

    /// The validated stage catalog.
    pub fn catalog(&self) -> Result<StageCatalog, ConfigError> {
        StageCatalog::new(self.stages.clone())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn task_deadline(&self) -> Option<Duration> {
        self.task_deadline_secs.map(Duration::from_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Ids of the agents in the pool.
    pub fn agent_ids(&self) -> Vec<String> {
        (0..self.num_agents).map(|i| format!("agent-{}", i)).collect()
    }

    /// Builder method to set the stage catalog.
    pub fn with_stages(mut self, stages: Vec<StageDefinition>) -> Self {
        self.stages = stages;
        self
    }

    /// Builder method to set the seed capabilities.
    pub fn with_capabilities(mut self, capabilities: Vec<CapabilitySeed>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Builder method to set max retries.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Builder method to set the confidence smoothing constant.
    pub fn with_confidence_alpha(mut self, alpha: f64) -> Self {
        self.confidence_alpha = alpha;
        self
    }

    /// Builder method to set the proof log timestamp policy.
    pub fn with_timestamp_policy(mut self, policy: TimestampPolicy) -> Self {
        self.timestamp_policy = policy;
        self
    }

    /// Builder method to set the agent count.
    pub fn with_num_agents(mut self, num_agents: usize) -> Self {
        self.num_agents = num_agents;
        self
    }

    /// Builder method to set the tick interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Builder method to set the per-visit deadline.
    pub fn with_task_deadline(mut self, deadline: Duration) -> Self {
        self.task_deadline_secs = Some(deadline.as_secs().max(1));
        self
    }

    /// Builder method to set database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Builder method to set the bind address.
    pub fn with_bind_address(mut self, address: impl Into<String>) -> Self {
        self.bind_address = address.into();
        self
    }

    /// Builder method to set the scorer endpoint.
    pub fn with_scorer_url(mut self, url: impl Into<String>) -> Self {
        self.scorer_url = Some(url.into());
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

fn parse_timestamp_policy(value: &str) -> Result<TimestampPolicy, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "reject" => Ok(TimestampPolicy::Reject),
        "clamp" => Ok(TimestampPolicy::Clamp),
        _ => Err(ConfigError::InvalidValue {
            key: "OPPORTUNITY_TIMESTAMP_POLICY".to_string(),
            message: format!("expected 'reject' or 'clamp', got '{}'", value),
        }),
    }
}
