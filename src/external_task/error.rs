//! Errors reported synchronously to a fetch-and-lock caller.

use thiserror::Error;

use crate::error::SchedulerError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchAndLockError {
    /// Malformed or out-of-range request; never queued
    #[error("Invalid fetch-and-lock request: {0}")]
    InvalidRequest(String),

    /// Missing or wrong credentials; never queued
    #[error("Unauthorized (realm \"{realm}\")")]
    Unauthorized { realm: String },

    #[error("Storage failure: {0}")]
    Storage(String),

    /// The coordinator stopped before the request was resolved
    #[error("Fetch-and-lock coordinator is shutting down")]
    ShuttingDown,
}

impl FetchAndLockError {
    /// HTTP-equivalent status code
    pub fn status_code(&self) -> u16 {
        match self {
            FetchAndLockError::InvalidRequest(_) => 400,
            FetchAndLockError::Unauthorized { .. } => 401,
            FetchAndLockError::Storage(_) => 500,
            FetchAndLockError::ShuttingDown => 503,
        }
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }
}

impl From<SchedulerError> for FetchAndLockError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::ValidationError(message) => FetchAndLockError::InvalidRequest(message),
            SchedulerError::ShuttingDown => FetchAndLockError::ShuttingDown,
            other => FetchAndLockError::Storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            FetchAndLockError::InvalidRequest("x".into()).status_code(),
            400
        );
        let unauthorized = FetchAndLockError::Unauthorized {
            realm: "engine".into(),
        };
        assert_eq!(unauthorized.status_code(), 401);
        assert!(unauthorized.is_client_error());
        assert_eq!(FetchAndLockError::Storage("x".into()).status_code(), 500);
        assert_eq!(FetchAndLockError::ShuttingDown.status_code(), 503);
    }

    #[test]
    fn test_scheduler_errors_map_to_storage() {
        let err: FetchAndLockError = SchedulerError::DatabaseError("down".into()).into();
        assert!(matches!(err, FetchAndLockError::Storage(_)));
    }
}
