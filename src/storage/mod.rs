//! Persistent storage.
//!
//! The stores keep their working set in memory and write every committed
//! mutation through a [`Repository`]:
//! - **MemoryRepository**: process-local, used by tests and ephemeral runs
//! - **SqliteRepository**: `sqlx` SQLite pool with the schema in [`schema`]
//! - **Migrations**: applies schema statements once, tracked in `_migrations`
//!
//! # Usage
//!
//! ```rust,ignore
//! use opportunity_forge::storage::{Repository, SqliteRepository};
//!
//! let repository = SqliteRepository::open("sqlite://forge.db").await?;
//! repository.ping().await?;
//! ```

pub mod database;
pub mod migrations;
pub mod repository;
pub mod schema;

use std::sync::Arc;

pub use database::SqliteRepository;
pub use migrations::{MigrationError, MigrationRunner};
pub use repository::{MemoryRepository, Repository, RepositoryError};

/// Opens the repository for `database_url`, or an in-memory one when unset.
pub async fn open_repository(
    database_url: Option<&str>,
) -> Result<Arc<dyn Repository>, RepositoryError> {
    match database_url {
        Some(url) => Ok(Arc::new(SqliteRepository::open(url).await?)),
        None => Ok(Arc::new(MemoryRepository::new())),
    }
}
