//! Error types for the scheduling core.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchedulerError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Work item {0} not found")]
    NotFound(String),
    #[error("Work item {work_item_id} is not locked by {worker_id}")]
    LockOwnership {
        work_item_id: String,
        worker_id: String,
    },
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Timeout error: {0}")]
    Timeout(String),
    #[error("Scheduler is shutting down")]
    ShuttingDown,
}

impl From<serde_json::Error> for SchedulerError {
    fn from(error: serde_json::Error) -> Self {
        SchedulerError::ValidationError(format!("JSON serialization error: {error}"))
    }
}

impl From<sqlx::Error> for SchedulerError {
    fn from(err: sqlx::Error) -> Self {
        SchedulerError::DatabaseError(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for SchedulerError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        SchedulerError::DatabaseError(format!("Migration failed: {err}"))
    }
}

impl From<crate::config::ConfigurationError> for SchedulerError {
    fn from(err: crate::config::ConfigurationError) -> Self {
        SchedulerError::ConfigurationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
