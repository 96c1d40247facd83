//! # Execution
//!
//! Running leased jobs: the [`JobHandler`] collaborator, the bounded
//! [`WorkerDispatchPool`] and the per-node [`JobExecutor`] loop.

pub mod job_executor;
pub mod job_handler;
pub mod worker_pool;

pub use job_executor::JobExecutor;
pub use job_handler::{JobExecutionError, JobHandler, NoopJobHandler};
pub use worker_pool::{BatchReport, Dispatched, ItemOutcome, ItemReport, WorkerDispatchPool};
