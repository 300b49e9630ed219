//! Error types for the scheduler.

use thiserror::Error;

/// Scheduler operation result type.
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Scheduler errors.
///
/// `Busy` is transient and safe to retry; `InvalidState` and `NotFound`
/// indicate caller bugs and are rejected; everything else is a storage or
/// encoding failure that rolls the current operation back.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Lock acquisition timed out
    #[error("Scheduler busy: lock acquisition timed out")]
    Busy,

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid lifecycle transition
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Underlying database failure
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO error (output files, exclusion file)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML configuration error
    #[error("Config error: {0}")]
    Config(#[from] serde_yaml::Error),

    /// Invalid address
    #[error("Address parse error: {0}")]
    Addr(#[from] std::net::AddrParseError),

    /// Invalid network prefix
    #[error("Network parse error: {0}")]
    Net(#[from] ipnet::AddrParseError),

    /// Invalid exclusion regex
    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),
}

impl SchedulerError {
    /// Create a not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an invalid state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }
}
