//! # Database Operations
//!
//! The lease store shared by every engine node.
//!
//! - [`lease_store`] - the [`LeaseStore`] trait and its query/claim types
//! - [`memory`] - single-process store for tests and embedded use
//! - [`postgres`] - `sqlx` backed store with bundled migrations

pub mod lease_store;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use lease_store::{
    compare_acquisition_order, ExternalTaskQuery, LeaseClaim, LeaseStore, TopicFilter,
};
pub use memory::InMemoryLeaseStore;
#[cfg(feature = "postgres")]
pub use postgres::{PgLeaseStore, MIGRATOR};
