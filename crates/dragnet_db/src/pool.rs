//! Database pool creation.
//!
//! Connection-level settings (WAL, synchronous mode, foreign keys) are
//! applied through `SqliteConnectOptions` so that every pooled connection
//! carries them, not just the first one.

use std::str::FromStr;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::info;

use crate::error::DbError;

/// Database pool type alias.
pub type DbPool = sqlx::SqlitePool;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL
    pub url: String,
    /// Maximum connections in the pool
    pub max_connections: u32,
}

impl DbConfig {
    /// Create a file-backed SQLite configuration.
    pub fn sqlite(path: impl AsRef<str>) -> Self {
        Self {
            url: format!("sqlite:{}", path.as_ref()),
            max_connections: 5,
        }
    }

    /// Create an in-memory SQLite configuration (for testing).
    ///
    /// A single connection: each in-memory connection is its own database,
    /// so a wider pool would hand out empty databases.
    pub fn sqlite_memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
        }
    }

    /// Set maximum connections.
    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }
}

/// Create a database pool from configuration.
pub async fn create_pool(config: &DbConfig) -> Result<DbPool, DbError> {
    let options = SqliteConnectOptions::from_str(&config.url)
        .map_err(|_| DbError::InvalidUrl(config.url.clone()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await?;

    info!("Connected to database at {}", config.url);
    Ok(pool)
}
