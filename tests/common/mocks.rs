use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lease_core::database::{ExternalTaskQuery, InMemoryLeaseStore, LeaseClaim, LeaseStore};
use lease_core::error::{Result, SchedulerError};
use lease_core::execution::{JobExecutionError, JobHandler};
use lease_core::models::{Incident, LeaseFields, WorkItem};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

pub const RIVAL_NODE: &str = "rival-node";

/// Store where a rival node wins the lease of selected items right before our claim lands
#[derive(Debug, Default)]
pub struct RacingStore {
    pub inner: InMemoryLeaseStore,
    contested: Mutex<HashSet<String>>,
}

impl RacingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contest(&self, id: &str) {
        self.contested.lock().insert(id.to_string());
    }
}

#[async_trait]
impl LeaseStore for RacingStore {
    async fn insert(&self, item: WorkItem) -> Result<()> {
        self.inner.insert(item).await
    }

    async fn find(&self, id: &str) -> Result<Option<WorkItem>> {
        self.inner.find(id).await
    }

    async fn select_acquirable_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<WorkItem>> {
        self.inner.select_acquirable_jobs(now, limit).await
    }

    async fn select_external_tasks(
        &self,
        query: &ExternalTaskQuery,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkItem>> {
        self.inner.select_external_tasks(query, now).await
    }

    async fn acquire_leases(&self, claims: &[LeaseClaim]) -> Result<Vec<bool>> {
        let rival_claims: Vec<LeaseClaim> = {
            let mut contested = self.contested.lock();
            claims
                .iter()
                .filter(|claim| contested.remove(&claim.work_item_id))
                .map(|claim| LeaseClaim {
                    lock_owner: RIVAL_NODE.to_string(),
                    ..claim.clone()
                })
                .collect()
        };
        if !rival_claims.is_empty() {
            self.inner.acquire_leases(&rival_claims).await?;
        }
        self.inner.acquire_leases(claims).await
    }

    async fn release_lease(&self, id: &str, expected: &LeaseFields) -> Result<bool> {
        self.inner.release_lease(id, expected).await
    }

    async fn extend_lease(
        &self,
        id: &str,
        expected: &LeaseFields,
        lock_expiration_time: DateTime<Utc>,
    ) -> Result<bool> {
        self.inner.extend_lease(id, expected, lock_expiration_time).await
    }

    async fn record_failure(
        &self,
        expected: &LeaseFields,
        updated: &WorkItem,
        incident: Option<&Incident>,
    ) -> Result<bool> {
        self.inner.record_failure(expected, updated, incident).await
    }

    async fn remove(&self, id: &str, expected: &LeaseFields) -> Result<bool> {
        self.inner.remove(id, expected).await
    }

    async fn set_retries(&self, id: &str, retries: u32) -> Result<bool> {
        self.inner.set_retries(id, retries).await
    }

    async fn open_incidents(&self) -> Result<Vec<Incident>> {
        self.inner.open_incidents().await
    }
}

/// Store whose selections and claims fail while `failing` is set
#[derive(Debug, Default)]
pub struct FailingStore {
    pub inner: InMemoryLeaseStore,
    pub failing: AtomicBool,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SchedulerError::DatabaseError("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for FailingStore {
    async fn insert(&self, item: WorkItem) -> Result<()> {
        self.inner.insert(item).await
    }

    async fn find(&self, id: &str) -> Result<Option<WorkItem>> {
        self.inner.find(id).await
    }

    async fn select_acquirable_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<WorkItem>> {
        self.check()?;
        self.inner.select_acquirable_jobs(now, limit).await
    }

    async fn select_external_tasks(
        &self,
        query: &ExternalTaskQuery,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkItem>> {
        self.check()?;
        self.inner.select_external_tasks(query, now).await
    }

    async fn acquire_leases(&self, claims: &[LeaseClaim]) -> Result<Vec<bool>> {
        self.check()?;
        self.inner.acquire_leases(claims).await
    }

    async fn release_lease(&self, id: &str, expected: &LeaseFields) -> Result<bool> {
        self.inner.release_lease(id, expected).await
    }

    async fn extend_lease(
        &self,
        id: &str,
        expected: &LeaseFields,
        lock_expiration_time: DateTime<Utc>,
    ) -> Result<bool> {
        self.inner.extend_lease(id, expected, lock_expiration_time).await
    }

    async fn record_failure(
        &self,
        expected: &LeaseFields,
        updated: &WorkItem,
        incident: Option<&Incident>,
    ) -> Result<bool> {
        self.inner.record_failure(expected, updated, incident).await
    }

    async fn remove(&self, id: &str, expected: &LeaseFields) -> Result<bool> {
        self.inner.remove(id, expected).await
    }

    async fn set_retries(&self, id: &str, retries: u32) -> Result<bool> {
        self.inner.set_retries(id, retries).await
    }

    async fn open_incidents(&self) -> Result<Vec<Incident>> {
        self.inner.open_incidents().await
    }
}

/// Store whose external task selection parks until [`open`](Self::open) once armed
#[derive(Debug, Default)]
pub struct GatedStore {
    pub inner: InMemoryLeaseStore,
    armed: AtomicBool,
    entered: Notify,
    gate: Notify,
}

impl GatedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Resolves once a selection is parked at the gate
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    pub fn open(&self) {
        self.armed.store(false, Ordering::SeqCst);
        self.gate.notify_one();
    }
}

#[async_trait]
impl LeaseStore for GatedStore {
    async fn insert(&self, item: WorkItem) -> Result<()> {
        self.inner.insert(item).await
    }

    async fn find(&self, id: &str) -> Result<Option<WorkItem>> {
        self.inner.find(id).await
    }

    async fn select_acquirable_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<WorkItem>> {
        self.inner.select_acquirable_jobs(now, limit).await
    }

    async fn select_external_tasks(
        &self,
        query: &ExternalTaskQuery,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkItem>> {
        if self.armed.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.gate.notified().await;
        }
        self.inner.select_external_tasks(query, now).await
    }

    async fn acquire_leases(&self, claims: &[LeaseClaim]) -> Result<Vec<bool>> {
        self.inner.acquire_leases(claims).await
    }

    async fn release_lease(&self, id: &str, expected: &LeaseFields) -> Result<bool> {
        self.inner.release_lease(id, expected).await
    }

    async fn extend_lease(
        &self,
        id: &str,
        expected: &LeaseFields,
        lock_expiration_time: DateTime<Utc>,
    ) -> Result<bool> {
        self.inner.extend_lease(id, expected, lock_expiration_time).await
    }

    async fn record_failure(
        &self,
        expected: &LeaseFields,
        updated: &WorkItem,
        incident: Option<&Incident>,
    ) -> Result<bool> {
        self.inner.record_failure(expected, updated, incident).await
    }

    async fn remove(&self, id: &str, expected: &LeaseFields) -> Result<bool> {
        self.inner.remove(id, expected).await
    }

    async fn set_retries(&self, id: &str, retries: u32) -> Result<bool> {
        self.inner.set_retries(id, retries).await
    }

    async fn open_incidents(&self) -> Result<Vec<Incident>> {
        self.inner.open_incidents().await
    }
}

/// Handler recording execution order and flagging overlapping runs of one process instance
#[derive(Debug, Default)]
pub struct RecordingHandler {
    executed: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    running: Mutex<HashMap<String, usize>>,
    overlap_detected: AtomicBool,
    delay: Option<Duration>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Default::default()
        })
    }

    pub fn fail(&self, id: &str) {
        self.failing.lock().insert(id.to_string());
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    pub fn overlap_detected(&self) -> bool {
        self.overlap_detected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn execute(&self, job: &WorkItem) -> std::result::Result<(), JobExecutionError> {
        let key = job.process_instance_id.clone();
        if let Some(key) = &key {
            let mut running = self.running.lock();
            let count = running.entry(key.clone()).or_default();
            *count += 1;
            if *count > 1 {
                self.overlap_detected.store(true, Ordering::SeqCst);
            }
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.executed.lock().push(job.id.clone());

        if let Some(key) = &key {
            if let Some(count) = self.running.lock().get_mut(key) {
                *count -= 1;
            }
        }

        if self.failing.lock().contains(&job.id) {
            return Err(JobExecutionError::failed(format!("{} failed", job.id)));
        }
        Ok(())
    }
}
