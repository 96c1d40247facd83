//! # Models
//!
//! Persisted state of the scheduling core: work items with their lease fields and the
//! incidents raised when a work item runs out of retries.

pub mod incident;
pub mod work_item;

pub use incident::{Incident, IncidentType};
pub use work_item::{LeaseFields, WorkItem, WorkItemKind, DEFAULT_PRIORITY, DEFAULT_RETRIES};
