//! SQLite-backed repository.
//!
//! Uses a `sqlx` connection pool. UUIDs are stored as hyphenated TEXT and
//! timestamps as RFC 3339 TEXT so the database file stays readable with the
//! stock `sqlite3` shell.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::migrations::MigrationRunner;
use super::repository::{Repository, RepositoryError};
use crate::capability::{Capability, CapabilityCategory};
use crate::opportunity::{Competition, Opportunity};
use crate::proof::{MetaProofEntry, ProofRecord};

/// SQLite repository.
pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    /// Connects to the database, creating the file if needed.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite URL (e.g., "sqlite://forge.db" or "sqlite::memory:")
    pub async fn connect(database_url: &str) -> Result<Self, RepositoryError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| RepositoryError::ConnectionFailed(e.to_string()))?
            .create_if_missing(true);

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30));

        // In-memory databases live and die with their single connection.
        if database_url.contains(":memory:") {
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| RepositoryError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Connects and applies pending migrations.
    pub async fn open(database_url: &str) -> Result<Self, RepositoryError> {
        let repository = Self::connect(database_url).await?;
        repository.run_migrations().await?;
        Ok(repository)
    }

    /// Creates a repository from an existing pool.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Runs database migrations.
    pub async fn run_migrations(&self) -> Result<(), RepositoryError> {
        let runner = MigrationRunner::new(self.pool.clone());
        runner.run_migrations().await?;
        Ok(())
    }
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn save_opportunity(&self, opportunity: &Opportunity) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO opportunities (
                id, title, description, market, score, trend, competition,
                revenue_potential, validated, source, discovered_at, stage, rejection_reason
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                score = excluded.score,
                trend = excluded.trend,
                validated = excluded.validated,
                stage = excluded.stage,
                rejection_reason = excluded.rejection_reason
            "#,
        )
        .bind(opportunity.id.to_string())
        .bind(&opportunity.title)
        .bind(&opportunity.description)
        .bind(&opportunity.market)
        .bind(opportunity.score)
        .bind(opportunity.trend)
        .bind(opportunity.competition.to_string())
        .bind(&opportunity.revenue_potential)
        .bind(opportunity.validated)
        .bind(&opportunity.source)
        .bind(opportunity.discovered_at.to_rfc3339())
        .bind(&opportunity.stage)
        .bind(&opportunity.rejection_reason)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_opportunities(&self) -> Result<Vec<Opportunity>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, description, market, score, trend, competition,
                   revenue_potential, validated, source, discovered_at, stage, rejection_reason
            FROM opportunities
            ORDER BY rowid
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(opportunity_from_row).collect()
    }

    async fn save_capability(&self, capability: &Capability) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO capabilities (id, name, category, confidence, learned_at, usage_count)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                confidence = excluded.confidence,
                usage_count = excluded.usage_count
            "#,
        )
        .bind(&capability.id)
        .bind(&capability.name)
        .bind(capability.category.to_string())
        .bind(capability.confidence)
        .bind(capability.learned_at.to_rfc3339())
        .bind(i64::try_from(capability.usage_count).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_capabilities(&self) -> Result<Vec<Capability>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, name, category, confidence, learned_at, usage_count FROM capabilities ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(capability_from_row).collect()
    }

    async fn append_proof(&self, record: &ProofRecord) -> Result<(), RepositoryError> {
        let position = i64::try_from(record.position)
            .map_err(|_| RepositoryError::InvalidData(format!("position {} overflows", record.position)))?;

        sqlx::query(
            r#"
            INSERT INTO proof_log (position, id, timestamp, action, agent, result, verified, digest)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(position)
        .bind(record.entry.id.to_string())
        .bind(record.entry.timestamp.to_rfc3339())
        .bind(&record.entry.action)
        .bind(&record.entry.agent)
        .bind(&record.entry.result)
        .bind(record.entry.verified)
        .bind(&record.digest)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_proof_verified(&self, id: Uuid) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE proof_log SET verified = 1 WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::ProofNotFound(id));
        }
        Ok(())
    }

    async fn load_proof(&self) -> Result<Vec<ProofRecord>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT position, id, timestamp, action, agent, result, verified, digest
            FROM proof_log
            ORDER BY position
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(proof_from_row).collect()
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn parse_uuid(value: &str) -> Result<Uuid, RepositoryError> {
    Uuid::parse_str(value).map_err(|e| RepositoryError::InvalidData(format!("uuid '{}': {}", value, e)))
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| RepositoryError::InvalidData(format!("timestamp '{}': {}", value, e)))
}

fn opportunity_from_row(row: &SqliteRow) -> Result<Opportunity, RepositoryError> {
    let id: String = row.try_get("id")?;
    let competition: String = row.try_get("competition")?;
    let discovered_at: String = row.try_get("discovered_at")?;

    Ok(Opportunity {
        id: parse_uuid(&id)?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        market: row.try_get("market")?,
        score: row.try_get("score")?,
        trend: row.try_get("trend")?,
        competition: Competition::from_str(&competition).map_err(RepositoryError::InvalidData)?,
        revenue_potential: row.try_get("revenue_potential")?,
        validated: row.try_get("validated")?,
        source: row.try_get("source")?,
        discovered_at: parse_timestamp(&discovered_at)?,
        stage: row.try_get("stage")?,
        rejection_reason: row.try_get("rejection_reason")?,
    })
}

fn capability_from_row(row: &SqliteRow) -> Result<Capability, RepositoryError> {
    let category: String = row.try_get("category")?;
    let category: CapabilityCategory = serde_json::from_value(serde_json::Value::String(category))?;
    let learned_at: String = row.try_get("learned_at")?;
    let usage_count: i64 = row.try_get("usage_count")?;

    Ok(Capability {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        category,
        confidence: row.try_get("confidence")?,
        learned_at: parse_timestamp(&learned_at)?,
        usage_count: u64::try_from(usage_count)
            .map_err(|_| RepositoryError::InvalidData(format!("usage_count {}", usage_count)))?,
    })
}

fn proof_from_row(row: &SqliteRow) -> Result<ProofRecord, RepositoryError> {
    let position: i64 = row.try_get("position")?;
    let id: String = row.try_get("id")?;
    let timestamp: String = row.try_get("timestamp")?;

    Ok(ProofRecord {
        position: u64::try_from(position)
            .map_err(|_| RepositoryError::InvalidData(format!("position {}", position)))?,
        entry: MetaProofEntry {
            id: parse_uuid(&id)?,
            timestamp: parse_timestamp(&timestamp)?,
            action: row.try_get("action")?,
            agent: row.try_get("agent")?,
            result: row.try_get("result")?,
            verified: row.try_get("verified")?,
        },
        digest: row.try_get("digest")?,
    })
}
