//! Error types for the database layer.

use thiserror::Error;

/// Database layer errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid database URL: {0}")]
    InvalidUrl(String),
}
