//! # Orchestration
//!
//! Deciding which work items this node leases and how they are grouped and retried.
//!
//! ## Core Components
//!
//! - **JobAcquisition**: one acquire cycle against the shared lease store
//! - **AcquisitionStrategy**: adaptive wait between acquire cycles
//! - **Exclusivity**: pure grouping of leased jobs into sequential batches
//! - **RetryPolicy**: reschedule or raise an incident after a failure
//!
//! The grouper and the retry policy have no I/O and no clock of their own.

pub mod acquisition_strategy;
pub mod exclusivity;
pub mod job_acquisition;
pub mod retry_policy;

pub use acquisition_strategy::{AcquisitionStrategy, CycleOutcome};
pub use exclusivity::{group_into_batches, ExclusivityScope, LeaseBatch};
pub use job_acquisition::{AcquiredJobs, JobAcquisition};
pub use retry_policy::{
    parse_iso_duration, BackoffStrategy, RetryDecision, RetryIntervals, RetryOutcome,
    RetryPolicy, RetryScheduleError,
};
