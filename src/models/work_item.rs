//! # Work Item
//!
//! A unit of deferred work tracked by id with a due date and a retry budget. Internal
//! jobs are acquired by the job executor; external tasks are handed to remote workers
//! through fetch-and-lock.
//!
//! A work item is **leasable** iff:
//!
//! - `due_date <= now`
//! - `lock_expiration_time` is `None` or `< now`
//! - `retries_remaining > 0`
//! - it is not suspended

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, SchedulerError};
use crate::orchestration::exclusivity::ExclusivityScope;

/// Priority assigned when the engine does not compute one
pub const DEFAULT_PRIORITY: i64 = 0;

/// Retry budget of a freshly created work item
pub const DEFAULT_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemKind {
    /// Executed in-process by the job executor
    Job,
    /// Fetched and executed by a remote worker
    ExternalTask,
}

impl WorkItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkItemKind::Job => "job",
            WorkItemKind::ExternalTask => "external_task",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "job" => Some(WorkItemKind::Job),
            "external_task" => Some(WorkItemKind::ExternalTask),
            _ => None,
        }
    }
}

/// The persisted lease state a compare-and-set is conditioned on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseFields {
    pub lock_owner: Option<String>,
    pub lock_expiration_time: Option<DateTime<Utc>>,
    pub revision: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub kind: WorkItemKind,
    pub topic_name: Option<String>,
    pub due_date: DateTime<Utc>,
    pub lock_owner: Option<String>,
    pub lock_expiration_time: Option<DateTime<Utc>>,
    pub retries_remaining: u32,
    pub exclusive: bool,
    /// Process instance the item belongs to
    pub process_instance_id: Option<String>,
    /// Root of the process hierarchy, precomputed when the item is created
    pub root_process_instance_id: Option<String>,
    pub priority: i64,
    pub last_failure_reason: Option<String>,
    pub failed_attempts: u32,
    pub suspended: bool,
    /// Incremented on every write; part of the lease compare-and-set condition
    pub revision: i32,
    pub business_key: Option<String>,
    pub process_definition_key: Option<String>,
    pub tenant_id: Option<String>,
    pub variables: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl WorkItem {
    /// New exclusive job, due at `due_date`
    pub fn job(id: impl Into<String>, due_date: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            kind: WorkItemKind::Job,
            topic_name: None,
            due_date,
            lock_owner: None,
            lock_expiration_time: None,
            retries_remaining: DEFAULT_RETRIES,
            exclusive: true,
            process_instance_id: None,
            root_process_instance_id: None,
            priority: DEFAULT_PRIORITY,
            last_failure_reason: None,
            failed_attempts: 0,
            suspended: false,
            revision: 1,
            business_key: None,
            process_definition_key: None,
            tenant_id: None,
            variables: Map::new(),
            created_at: due_date,
        }
    }

    /// New external task on `topic_name`, due immediately at `created_at`
    pub fn external_task(
        id: impl Into<String>,
        topic_name: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: WorkItemKind::ExternalTask,
            topic_name: Some(topic_name.into()),
            exclusive: false,
            ..Self::job(id, created_at)
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries_remaining = retries;
        self
    }

    pub fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// Attach the item to a process instance; the hierarchy root defaults to the instance
    pub fn in_process_instance(
        mut self,
        process_instance_id: impl Into<String>,
        root_process_instance_id: Option<String>,
    ) -> Self {
        let instance = process_instance_id.into();
        self.root_process_instance_id = root_process_instance_id.or_else(|| Some(instance.clone()));
        self.process_instance_id = Some(instance);
        self
    }

    pub fn with_business_key(mut self, business_key: impl Into<String>) -> Self {
        self.business_key = Some(business_key.into());
        self
    }

    pub fn with_process_definition_key(mut self, key: impl Into<String>) -> Self {
        self.process_definition_key = Some(key.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.variables.insert(name.into(), value);
        self
    }

    pub fn suspended(mut self) -> Self {
        self.suspended = true;
        self
    }

    pub fn is_leasable(&self, now: DateTime<Utc>) -> bool {
        self.due_date <= now
            && self.lock_expiration_time.map_or(true, |expires| expires < now)
            && self.retries_remaining > 0
            && !self.suspended
    }

    /// Retries exhausted after a failure
    pub fn is_failed(&self) -> bool {
        self.retries_remaining == 0
    }

    pub fn is_locked_by(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.lock_owner.as_deref() == Some(owner)
            && self.lock_expiration_time.is_some_and(|expires| expires >= now)
    }

    pub fn lease_fields(&self) -> LeaseFields {
        LeaseFields {
            lock_owner: self.lock_owner.clone(),
            lock_expiration_time: self.lock_expiration_time,
            revision: self.revision,
        }
    }

    /// Key under which this item must not run concurrently with its siblings
    pub fn exclusivity_key(&self, scope: ExclusivityScope) -> Option<&str> {
        if !self.exclusive {
            return None;
        }
        match scope {
            ExclusivityScope::ProcessInstance => self.process_instance_id.as_deref(),
            ExclusivityScope::ProcessHierarchy => self
                .root_process_instance_id
                .as_deref()
                .or(self.process_instance_id.as_deref()),
        }
    }

    /// Lease expiration for a lease taken at `now`, truncated to the millisecond so it
    /// compares equal after a round trip through storage.
    ///
    /// Fails with `ValidationError` when the expiration is not representable.
    pub fn lease_expiration(now: DateTime<Utc>, lease_duration_millis: u64) -> Result<DateTime<Utc>> {
        let expires = offset_millis(now, lease_duration_millis).ok_or_else(|| {
            SchedulerError::ValidationError(format!(
                "Lease duration of {lease_duration_millis}ms is out of range"
            ))
        })?;
        Ok(expires
            .duration_trunc(Duration::milliseconds(1))
            .unwrap_or(expires))
    }
}

/// `now + millis`, or `None` when the result overflows
pub(crate) fn offset_millis(now: DateTime<Utc>, millis: u64) -> Option<DateTime<Utc>> {
    let millis = i64::try_from(millis).ok()?;
    now.checked_add_signed(Duration::try_milliseconds(millis)?)
}
