//! # Lease Store
//!
//! The persisted table of work items, shared by every engine node. All writes to lease
//! fields are compare-and-set against the [`LeaseFields`] read earlier; a failed
//! condition returns `Ok(false)` and is never an error. Storage failures are errors.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt::Debug;

use crate::error::Result;
use crate::models::{Incident, LeaseFields, WorkItem, WorkItemKind};

/// One optimistic lease attempt: take `work_item_id` iff its lease fields still equal `expected`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseClaim {
    pub work_item_id: String,
    pub expected: LeaseFields,
    pub lock_owner: String,
    pub lock_expiration_time: DateTime<Utc>,
}

impl LeaseClaim {
    pub fn for_item(item: &WorkItem, owner: &str, lock_expiration_time: DateTime<Utc>) -> Self {
        Self {
            work_item_id: item.id.clone(),
            expected: item.lease_fields(),
            lock_owner: owner.to_string(),
            lock_expiration_time,
        }
    }

    /// The item as it looks once this claim has been applied
    pub fn apply_to(&self, item: &WorkItem) -> WorkItem {
        let mut leased = item.clone();
        leased.lock_owner = Some(self.lock_owner.clone());
        leased.lock_expiration_time = Some(self.lock_expiration_time);
        leased.revision = self.expected.revision + 1;
        leased
    }
}

/// Topic-level filter of a fetch-and-lock request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopicFilter {
    pub topic_name: String,
    pub business_key: Option<String>,
    pub process_definition_key_in: Option<Vec<String>>,
    pub tenant_id_in: Option<Vec<String>>,
    pub without_tenant_id: bool,
}

impl TopicFilter {
    pub fn new(topic_name: impl Into<String>) -> Self {
        Self {
            topic_name: topic_name.into(),
            ..Default::default()
        }
    }

    pub fn matches(&self, item: &WorkItem) -> bool {
        if item.topic_name.as_deref() != Some(self.topic_name.as_str()) {
            return false;
        }
        if let Some(business_key) = &self.business_key {
            if item.business_key.as_ref() != Some(business_key) {
                return false;
            }
        }
        if let Some(keys) = &self.process_definition_key_in {
            match &item.process_definition_key {
                Some(key) if keys.contains(key) => {}
                _ => return false,
            }
        }
        if self.without_tenant_id && item.tenant_id.is_some() {
            return false;
        }
        if let Some(tenants) = &self.tenant_id_in {
            match &item.tenant_id {
                Some(tenant) if tenants.contains(tenant) => {}
                _ => return false,
            }
        }
        true
    }
}

/// Candidate selection for external tasks, scoped to one caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalTaskQuery {
    pub worker_id: String,
    pub topics: Vec<TopicFilter>,
    pub use_priority: bool,
    /// Upper bound on candidates returned
    pub limit: usize,
    /// Tenant memberships of the authenticated caller; `None` means unrestricted
    pub authorized_tenant_ids: Option<Vec<String>>,
}

impl ExternalTaskQuery {
    pub fn topic_names(&self) -> Vec<String> {
        self.topics.iter().map(|t| t.topic_name.clone()).collect()
    }

    /// Whether `item` is a leasable candidate for this caller at `now`
    pub fn matches(&self, item: &WorkItem, now: DateTime<Utc>) -> bool {
        if item.kind != WorkItemKind::ExternalTask || !item.is_leasable(now) {
            return false;
        }
        if let (Some(tenants), Some(tenant)) = (&self.authorized_tenant_ids, &item.tenant_id) {
            if !tenants.contains(tenant) {
                return false;
            }
        }
        self.topics.iter().any(|topic| topic.matches(item))
    }

    /// Priority first when requested, then creation order, then id
    pub fn compare(&self, a: &WorkItem, b: &WorkItem) -> Ordering {
        let by_priority = if self.use_priority {
            b.priority.cmp(&a.priority)
        } else {
            Ordering::Equal
        };
        by_priority
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    }
}

/// Acquisition order for jobs: priority descending, due date ascending, id ascending
pub fn compare_acquisition_order(a: &WorkItem, b: &WorkItem) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.due_date.cmp(&b.due_date))
        .then_with(|| a.id.cmp(&b.id))
}

#[async_trait]
pub trait LeaseStore: Send + Sync + Debug {
    async fn insert(&self, item: WorkItem) -> Result<()>;

    async fn find(&self, id: &str) -> Result<Option<WorkItem>>;

    /// Up to `limit` leasable jobs in acquisition order
    async fn select_acquirable_jobs(&self, now: DateTime<Utc>, limit: usize)
        -> Result<Vec<WorkItem>>;

    /// Leasable external tasks matching `query`, in the query's order
    async fn select_external_tasks(
        &self,
        query: &ExternalTaskQuery,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkItem>>;

    /// Apply all claims as one atomic unit.
    ///
    /// Entry `i` of the result tells whether claim `i` won. A storage error leaves no
    /// claim applied.
    async fn acquire_leases(&self, claims: &[LeaseClaim]) -> Result<Vec<bool>>;

    /// Clear the lease, leaving retries and due date untouched
    async fn release_lease(&self, id: &str, expected: &LeaseFields) -> Result<bool>;

    async fn extend_lease(
        &self,
        id: &str,
        expected: &LeaseFields,
        lock_expiration_time: DateTime<Utc>,
    ) -> Result<bool>;

    /// Persist the outcome of a failed execution and, when given, its incident.
    ///
    /// Writes `retries_remaining`, `due_date`, `last_failure_reason` and
    /// `failed_attempts` from `updated` and clears the lease.
    async fn record_failure(
        &self,
        expected: &LeaseFields,
        updated: &WorkItem,
        incident: Option<&Incident>,
    ) -> Result<bool>;

    /// Delete a successfully completed item
    async fn remove(&self, id: &str, expected: &LeaseFields) -> Result<bool>;

    /// Operator reset of the retry budget; resolves open incidents of the item
    async fn set_retries(&self, id: &str, retries: u32) -> Result<bool>;

    async fn open_incidents(&self) -> Result<Vec<Incident>>;
}
