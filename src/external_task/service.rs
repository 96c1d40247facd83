//! # External Task Service
//!
//! Lease attempts scoped to one long-poll caller, plus the operations a worker performs on
//! the tasks it holds. All lease writes go through the [`LeaseStore`] compare-and-set
//! primitives, so a worker whose lease expired and was taken over can neither complete
//! nor fail the task.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, instrument};

use super::auth::Authentication;
use super::dto::{FetchAndLockRequest, LockedExternalTask, MAX_LOCK_DURATION_MILLIS};
use crate::clock::Clock;
use crate::database::{LeaseClaim, LeaseStore};
use crate::error::{Result, SchedulerError};
use crate::logging::log_lease_operation;
use crate::models::WorkItem;
use crate::orchestration::retry_policy::RetryPolicy;

#[derive(Debug, Clone)]
pub struct ExternalTaskService {
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    overfetch_factor: usize,
}

impl ExternalTaskService {
    pub fn new(store: Arc<dyn LeaseStore>, clock: Arc<dyn Clock>, overfetch_factor: usize) -> Self {
        Self {
            store,
            clock,
            overfetch_factor: overfetch_factor.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }

    /// Lease up to `request.max_items` tasks for the caller.
    ///
    /// Candidates are claimed in chunks; claims lost to another worker are replaced by
    /// the next candidates until the request is satisfied or candidates run out.
    #[instrument(skip(self, request, authentication), fields(worker_id = %request.worker_id))]
    pub async fn fetch_and_lock(
        &self,
        request: &FetchAndLockRequest,
        authentication: Option<&Authentication>,
    ) -> Result<Vec<LockedExternalTask>> {
        if request.max_items == 0 || request.topics.is_empty() {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let query = request.query(
            authentication.map(|auth| auth.tenant_ids.clone()),
            self.overfetch_factor,
        );
        let candidates = self.store.select_external_tasks(&query, now).await?;

        let mut locked = Vec::with_capacity(request.max_items);
        let mut remaining = candidates.iter();
        while locked.len() < request.max_items {
            let wanted = request.max_items - locked.len();
            let mut chunk: Vec<(&WorkItem, LeaseClaim)> = Vec::with_capacity(wanted);
            while chunk.len() < wanted {
                let Some(item) = remaining.next() else {
                    break;
                };
                let Some(topic) = request.topic_for(item) else {
                    continue;
                };
                let expires = WorkItem::lease_expiration(now, topic.lock_duration_millis)?;
                chunk.push((item, LeaseClaim::for_item(item, &request.worker_id, expires)));
            }
            if chunk.is_empty() {
                break;
            }

            let claims: Vec<LeaseClaim> = chunk.iter().map(|(_, claim)| claim.clone()).collect();
            let results = self.store.acquire_leases(&claims).await?;
            if results.len() != claims.len() {
                return Err(SchedulerError::InvalidState(format!(
                    "Lease store answered {} of {} claims",
                    results.len(),
                    claims.len()
                )));
            }

            for ((item, claim), won) in chunk.iter().zip(results) {
                if !won {
                    debug!(work_item_id = %item.id, "Lost external task lease race");
                    continue;
                }
                let leased = claim.apply_to(item);
                if let Some(task) = request
                    .topic_for(&leased)
                    .and_then(|topic| LockedExternalTask::from_leased(&leased, topic, &request.worker_id))
                {
                    locked.push(task);
                }
            }
        }

        debug!(
            candidates = candidates.len(),
            locked = locked.len(),
            "Fetch-and-lock attempt finished"
        );
        Ok(locked)
    }

    /// Complete a task held by `worker_id`; the task is removed
    pub async fn complete(&self, id: &str, worker_id: &str) -> Result<()> {
        let item = self.owned_item(id, worker_id).await?;
        if !self.store.remove(id, &item.lease_fields()).await? {
            return Err(lock_ownership(id, worker_id));
        }
        log_lease_operation("complete", id, Some(worker_id), "removed", None);
        Ok(())
    }

    /// Report a worker failure with the worker's own retry budget and delay
    pub async fn handle_failure(
        &self,
        id: &str,
        worker_id: &str,
        error_message: &str,
        retries: u32,
        retry_timeout_millis: u64,
    ) -> Result<()> {
        let item = self.owned_item(id, worker_id).await?;
        let decision = RetryPolicy::on_reported_failure(
            &item,
            error_message,
            retries,
            retry_timeout_millis,
            self.clock.now(),
        )?;

        if !self
            .store
            .record_failure(&item.lease_fields(), &decision.updated, decision.incident())
            .await?
        {
            return Err(lock_ownership(id, worker_id));
        }

        let status = if decision.is_terminal() {
            "incident"
        } else {
            "rescheduled"
        };
        log_lease_operation("handle_failure", id, Some(worker_id), status, Some(error_message));
        Ok(())
    }

    /// Push the lock expiration of a held task to `now + new_duration_millis`
    pub async fn extend_lock(
        &self,
        id: &str,
        worker_id: &str,
        new_duration_millis: u64,
    ) -> Result<DateTime<Utc>> {
        if !(1..=MAX_LOCK_DURATION_MILLIS).contains(&new_duration_millis) {
            return Err(SchedulerError::ValidationError(format!(
                "Lock duration {new_duration_millis}ms outside [1, {MAX_LOCK_DURATION_MILLIS}]"
            )));
        }
        let item = self.owned_item(id, worker_id).await?;
        let expires = WorkItem::lease_expiration(self.clock.now(), new_duration_millis)?;

        if !self
            .store
            .extend_lease(id, &item.lease_fields(), expires)
            .await?
        {
            return Err(lock_ownership(id, worker_id));
        }
        log_lease_operation("extend_lock", id, Some(worker_id), "extended", None);
        Ok(expires)
    }

    /// Clear the lease of a task regardless of its owner
    pub async fn unlock(&self, id: &str) -> Result<()> {
        let item = self
            .store
            .find(id)
            .await?
            .ok_or_else(|| not_found(id))?;
        if item.lock_owner.is_none() {
            return Ok(());
        }
        if !self.store.release_lease(id, &item.lease_fields()).await? {
            return Err(SchedulerError::InvalidState(format!(
                "External task {id} changed while unlocking"
            )));
        }
        log_lease_operation("unlock", id, item.lock_owner.as_deref(), "released", None);
        Ok(())
    }

    pub async fn set_retries(&self, id: &str, retries: u32) -> Result<()> {
        if !self.store.set_retries(id, retries).await? {
            return Err(not_found(id));
        }
        log_lease_operation("set_retries", id, None, "updated", None);
        Ok(())
    }

    /// Release leases taken for a caller that is no longer waiting.
    ///
    /// Returns the number of leases released.
    pub async fn release(&self, tasks: &[LockedExternalTask]) -> Result<usize> {
        let mut released = 0;
        for task in tasks {
            let Some(item) = self.store.find(&task.id).await? else {
                continue;
            };
            if item.lock_owner.as_deref() != Some(task.worker_id.as_str()) {
                continue;
            }
            if self.store.release_lease(&task.id, &item.lease_fields()).await? {
                released += 1;
                log_lease_operation(
                    "release",
                    &task.id,
                    Some(&task.worker_id),
                    "released",
                    Some("caller gone"),
                );
            }
        }
        Ok(released)
    }

    async fn owned_item(&self, id: &str, worker_id: &str) -> Result<WorkItem> {
        let item = self
            .store
            .find(id)
            .await?
            .ok_or_else(|| not_found(id))?;
        if !item.is_locked_by(worker_id, self.clock.now()) {
            return Err(lock_ownership(id, worker_id));
        }
        Ok(item)
    }
}

fn not_found(id: &str) -> SchedulerError {
    SchedulerError::NotFound(format!("External task {id}"))
}

fn lock_ownership(id: &str, worker_id: &str) -> SchedulerError {
    SchedulerError::LockOwnership {
        work_item_id: id.to_string(),
        worker_id: worker_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::database::InMemoryLeaseStore;
    use crate::external_task::dto::FetchTopic;
    use chrono::TimeZone;

    fn setup() -> (Arc<InMemoryLeaseStore>, Arc<ManualClock>, ExternalTaskService) {
        let store = Arc::new(InMemoryLeaseStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap(),
        ));
        let service = ExternalTaskService::new(store.clone(), clock.clone(), 2);
        (store, clock, service)
    }

    fn request(worker: &str, max: usize) -> FetchAndLockRequest {
        FetchAndLockRequest::new(worker, max).with_topic(FetchTopic::new("invoice", 30_000))
    }

    #[tokio::test]
    async fn test_fetch_and_lock_leases_matching_tasks() {
        let (store, clock, service) = setup();
        let created = clock.now();
        store
            .insert(WorkItem::external_task("t1", "invoice", created))
            .await
            .unwrap();
        store
            .insert(WorkItem::external_task("t2", "shipping", created))
            .await
            .unwrap();

        let locked = service.fetch_and_lock(&request("w1", 5), None).await.unwrap();

        assert_eq!(locked.len(), 1);
        assert_eq!(locked[0].id, "t1");
        assert_eq!(
            locked[0].lock_expiration_time,
            clock.now() + chrono::Duration::milliseconds(30_000)
        );
        let stored = store.find("t1").await.unwrap().unwrap();
        assert_eq!(stored.lock_owner.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn test_priority_ordering_when_requested() {
        let (store, clock, service) = setup();
        let created = clock.now();
        store
            .insert(WorkItem::external_task("low", "invoice", created))
            .await
            .unwrap();
        store
            .insert(WorkItem::external_task("high", "invoice", created).with_priority(10))
            .await
            .unwrap();

        let locked = service
            .fetch_and_lock(&request("w1", 1).with_priority(), None)
            .await
            .unwrap();

        assert_eq!(locked[0].id, "high");
    }

    #[tokio::test]
    async fn test_tenant_scoping() {
        let (store, clock, service) = setup();
        let created = clock.now();
        store
            .insert(WorkItem::external_task("a", "invoice", created).with_tenant("tenant-a"))
            .await
            .unwrap();
        store
            .insert(WorkItem::external_task("b", "invoice", created).with_tenant("tenant-b"))
            .await
            .unwrap();
        let auth = Authentication {
            user_id: "demo".into(),
            group_ids: vec![],
            tenant_ids: vec!["tenant-a".into()],
        };

        let locked = service
            .fetch_and_lock(&request("w1", 5), Some(&auth))
            .await
            .unwrap();

        assert_eq!(locked.len(), 1);
        assert_eq!(locked[0].id, "a");
    }

    #[tokio::test]
    async fn test_complete_requires_lock_owner() {
        let (store, clock, service) = setup();
        store
            .insert(WorkItem::external_task("t1", "invoice", clock.now()))
            .await
            .unwrap();
        service.fetch_and_lock(&request("w1", 1), None).await.unwrap();

        let err = service.complete("t1", "w2").await.unwrap_err();
        assert!(matches!(err, SchedulerError::LockOwnership { .. }));
        assert!(matches!(
            service.complete("missing", "w1").await,
            Err(SchedulerError::NotFound(_))
        ));

        service.complete("t1", "w1").await.unwrap();
        assert!(store.find("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_handle_failure_reschedules_then_raises_incident() {
        let (store, clock, service) = setup();
        store
            .insert(WorkItem::external_task("t1", "invoice", clock.now()))
            .await
            .unwrap();
        service.fetch_and_lock(&request("w1", 1), None).await.unwrap();

        service
            .handle_failure("t1", "w1", "timeout", 2, 5_000)
            .await
            .unwrap();
        let item = store.find("t1").await.unwrap().unwrap();
        assert_eq!(item.retries_remaining, 2);
        assert_eq!(item.lock_owner, None);
        assert_eq!(item.due_date, clock.now() + chrono::Duration::milliseconds(5_000));
        assert!(service
            .fetch_and_lock(&request("w1", 1), None)
            .await
            .unwrap()
            .is_empty());

        clock.advance_millis(5_000);
        service.fetch_and_lock(&request("w1", 1), None).await.unwrap();
        service
            .handle_failure("t1", "w1", "fatal", 0, 0)
            .await
            .unwrap();

        let incidents = store.open_incidents().await.unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].message, "fatal");

        service.set_retries("t1", 1).await.unwrap();
        assert!(store.open_incidents().await.unwrap().is_empty());
        assert_eq!(
            service.fetch_and_lock(&request("w1", 1), None).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_extend_lock_and_unlock() {
        let (store, clock, service) = setup();
        store
            .insert(WorkItem::external_task("t1", "invoice", clock.now()))
            .await
            .unwrap();
        service.fetch_and_lock(&request("w1", 1), None).await.unwrap();

        let expires = service.extend_lock("t1", "w1", 120_000).await.unwrap();
        assert_eq!(expires, clock.now() + chrono::Duration::milliseconds(120_000));
        assert!(matches!(
            service.extend_lock("t1", "w2", 1_000).await,
            Err(SchedulerError::LockOwnership { .. })
        ));

        clock.advance_millis(120_001);
        assert!(matches!(
            service.extend_lock("t1", "w1", 1_000).await,
            Err(SchedulerError::LockOwnership { .. })
        ));

        service.unlock("t1").await.unwrap();
        let item = store.find("t1").await.unwrap().unwrap();
        assert_eq!(item.lock_owner, None);
        assert_eq!(item.lock_expiration_time, None);
    }

    #[tokio::test]
    async fn test_out_of_range_durations_never_lease_or_move_a_task() {
        let (store, clock, service) = setup();
        store
            .insert(WorkItem::external_task("t1", "invoice", clock.now()))
            .await
            .unwrap();

        let unbounded = FetchAndLockRequest::new("w1", 1)
            .with_topic(FetchTopic::new("invoice", u64::MAX));
        let err = service.fetch_and_lock(&unbounded, None).await.unwrap_err();
        assert!(matches!(err, SchedulerError::ValidationError(_)));
        assert_eq!(store.find("t1").await.unwrap().unwrap().lock_owner, None);

        let held = service.fetch_and_lock(&request("w1", 1), None).await.unwrap();
        assert_eq!(held.len(), 1);
        assert!(service.fetch_and_lock(&request("w2", 1), None).await.unwrap().is_empty());

        for millis in [u64::MAX, 10_000_000_000_000_000] {
            assert!(matches!(
                service.extend_lock("t1", "w1", millis).await,
                Err(SchedulerError::ValidationError(_))
            ));
            assert!(matches!(
                service.handle_failure("t1", "w1", "boom", 2, millis).await,
                Err(SchedulerError::ValidationError(_))
            ));
        }

        let item = store.find("t1").await.unwrap().unwrap();
        assert_eq!(item.lock_owner.as_deref(), Some("w1"));
        assert_eq!(item.lock_expiration_time, Some(held[0].lock_expiration_time));
        assert_eq!(item.retries_remaining, 3);
    }
}
