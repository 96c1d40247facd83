//! # Job Handler
//!
//! The "execute work item" collaborator. The dispatch pool hands every leased job to a
//! [`JobHandler`] and applies the retry policy to whatever it returns.

use async_trait::async_trait;
use std::fmt::Debug;
use thiserror::Error;

use crate::models::WorkItem;

/// Why a job's behavior failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobExecutionError {
    /// The behavior ran and reported a failure
    #[error("{0}")]
    Failed(String),

    /// The behavior exceeded the configured execution timeout
    #[error("Execution timed out after {0}ms")]
    TimedOut(u64),
}

impl JobExecutionError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Runs the business logic behind a leased job
#[async_trait]
pub trait JobHandler: Send + Sync + Debug {
    /// Execute `job`.
    ///
    /// The caller holds the lease for the duration of the call. Returning `Ok` deletes
    /// the job; returning `Err` consumes one retry.
    async fn execute(&self, job: &WorkItem) -> Result<(), JobExecutionError>;
}

/// Handler that succeeds for every job
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopJobHandler;

#[async_trait]
impl JobHandler for NoopJobHandler {
    async fn execute(&self, _job: &WorkItem) -> Result<(), JobExecutionError> {
        Ok(())
    }
}
