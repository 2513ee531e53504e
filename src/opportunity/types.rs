//! Opportunity record types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pseudo-stage id of rejected opportunities.
pub const REJECTED_STAGE: &str = "rejected";

/// Competitive pressure in an opportunity's market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Competition {
    Low,
    #[default]
    Medium,
    High,
}

impl fmt::Display for Competition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Competition::Low => write!(f, "low"),
            Competition::Medium => write!(f, "medium"),
            Competition::High => write!(f, "high"),
        }
    }
}

impl FromStr for Competition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Competition::Low),
            "medium" => Ok(Competition::Medium),
            "high" => Ok(Competition::High),
            other => Err(format!("unknown competition level '{}'", other)),
        }
    }
}

/// A candidate business opportunity moving through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub market: String,
    pub score: f64,
    pub trend: f64,
    pub competition: Competition,
    pub revenue_potential: String,
    pub validated: bool,
    pub source: String,
    pub discovered_at: DateTime<Utc>,
    /// Current stage id, or [`REJECTED_STAGE`].
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

impl Opportunity {
    /// Whether the record was rejected.
    pub fn is_rejected(&self) -> bool {
        self.stage == REJECTED_STAGE
    }

    /// Whether the record accepts no further mutation.
    pub fn is_terminal(&self) -> bool {
        self.is_rejected() || self.validated
    }
}

/// Input for creating an opportunity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityCandidate {
    pub title: String,
    pub description: String,
    pub market: String,
    pub source: String,
    #[serde(default)]
    pub competition: Option<Competition>,
    #[serde(default)]
    pub revenue_potential: Option<String>,
}

impl OpportunityCandidate {
    /// Creates a candidate with the required fields.
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        market: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            market: market.into(),
            source: source.into(),
            competition: None,
            revenue_potential: None,
        }
    }

    pub fn with_competition(mut self, competition: Competition) -> Self {
        self.competition = Some(competition);
        self
    }

    pub fn with_revenue_potential(mut self, revenue: impl Into<String>) -> Self {
        self.revenue_potential = Some(revenue.into());
        self
    }

    /// Returns the name of the first required field that is blank.
    pub fn missing_field(&self) -> Option<&'static str> {
        [
            ("title", &self.title),
            ("description", &self.description),
            ("market", &self.market),
            ("source", &self.source),
        ]
        .into_iter()
        .find(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
    }
}

/// Listing filter. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpportunityFilter {
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub validated: Option<bool>,
}

impl OpportunityFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn with_validated(mut self, validated: bool) -> Self {
        self.validated = Some(validated);
        self
    }

    /// Whether `opportunity` passes the filter.
    pub fn matches(&self, opportunity: &Opportunity) -> bool {
        self.stage
            .as_ref()
            .map_or(true, |stage| *stage == opportunity.stage)
            && self.validated.map_or(true, |v| v == opportunity.validated)
    }
}
