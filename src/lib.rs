#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Lease Core
//!
//! Asynchronous work-scheduling core of a business-process engine.
//!
//! ## Overview
//!
//! Deferred work items (timer jobs, asynchronous continuations, external tasks) live in a
//! lease store shared by every engine node. Nodes compete for them with optimistic
//! compare-and-set leases, so at most one node holds a live lease on an item at a time.
//!
//! ## Architecture
//!
//! Two consumers share the same leasing mechanism:
//!
//! - **Push**: each node runs a [`JobExecutor`] loop that acquires due jobs, groups them
//!   into exclusivity batches and runs the batches on a bounded [`WorkerDispatchPool`].
//! - **Pull**: external workers long-poll the [`FetchAndLockHandler`], which parks requests
//!   until matching external tasks appear or the caller's deadline passes.
//!
//! Failures go through the [`RetryPolicy`]: rescheduled while retries remain, an
//! incident once they run out.
//!
//! ## Module Organization
//!
//! - [`models`] - work items, lease fields and incidents
//! - [`database`] - the [`LeaseStore`] trait with in-memory and PostgreSQL stores
//! - [`orchestration`] - acquisition, exclusivity grouping, retry policy
//! - [`execution`] - job handler seam, dispatch pool, executor loop
//! - [`external_task`] - fetch-and-lock protocol and worker operations
//! - [`config`] - YAML configuration with environment overrides
//! - [`logging`] - structured logging setup
//! - [`bootstrap`] - wiring of one engine node
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lease_core::bootstrap::SchedulerSystem;
//! use lease_core::clock::SystemClock;
//! use lease_core::config::ConfigManager;
//! use lease_core::database::InMemoryLeaseStore;
//! use lease_core::execution::NoopJobHandler;
//! use lease_core::external_task::InMemoryIdentityProvider;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let config = manager.config();
//!
//! let system = SchedulerSystem::bootstrap(
//!     config,
//!     Arc::new(InMemoryLeaseStore::new()),
//!     Arc::new(NoopJobHandler),
//!     Arc::new(InMemoryIdentityProvider::from_config(&config.auth)),
//!     Arc::new(SystemClock),
//! )
//! .await?;
//!
//! system.stop(Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit and integration tests
//! cargo bench --features benchmarks
//! ```

pub mod bootstrap;
pub mod clock;
pub mod config;
pub mod database;
pub mod error;
pub mod execution;
pub mod external_task;
pub mod logging;
pub mod models;
pub mod orchestration;

pub use bootstrap::SchedulerSystem;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigManager, SchedulerConfig};
pub use database::{InMemoryLeaseStore, LeaseStore};
pub use error::{Result, SchedulerError};
pub use execution::{JobExecutor, JobHandler, WorkerDispatchPool};
pub use external_task::{FetchAndLockError, FetchAndLockHandler, FetchAndLockRequest};
pub use models::{Incident, WorkItem};
pub use orchestration::{ExclusivityScope, JobAcquisition, RetryPolicy};
