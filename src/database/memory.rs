//! # In-Memory Lease Store
//!
//! Single-process [`LeaseStore`] used by tests and embedded deployments. One mutex guards
//! items and incidents together, so every trait call is atomic, including
//! [`LeaseStore::acquire_leases`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::debug;

use super::lease_store::{compare_acquisition_order, ExternalTaskQuery, LeaseClaim, LeaseStore};
use crate::error::{Result, SchedulerError};
use crate::models::{Incident, LeaseFields, WorkItem, WorkItemKind};

#[derive(Debug, Default)]
struct MemoryState {
    items: BTreeMap<String, WorkItem>,
    incidents: Vec<Incident>,
}

#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    state: Mutex<MemoryState>,
}

fn lease_matches(item: &WorkItem, expected: &LeaseFields) -> bool {
    item.revision == expected.revision
        && item.lock_owner == expected.lock_owner
        && item.lock_expiration_time == expected.lock_expiration_time
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored item, ordered by id
    pub fn all_items(&self) -> Vec<WorkItem> {
        self.state.lock().items.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn insert(&self, item: WorkItem) -> Result<()> {
        let mut state = self.state.lock();
        if state.items.contains_key(&item.id) {
            return Err(SchedulerError::ValidationError(format!(
                "Work item {} already exists",
                item.id
            )));
        }
        state.items.insert(item.id.clone(), item);
        Ok(())
    }

    async fn find(&self, id: &str) -> Result<Option<WorkItem>> {
        Ok(self.state.lock().items.get(id).cloned())
    }

    async fn select_acquirable_jobs(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WorkItem>> {
        let state = self.state.lock();
        let mut candidates: Vec<WorkItem> = state
            .items
            .values()
            .filter(|item| item.kind == WorkItemKind::Job && item.is_leasable(now))
            .cloned()
            .collect();
        candidates.sort_by(compare_acquisition_order);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn select_external_tasks(
        &self,
        query: &ExternalTaskQuery,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkItem>> {
        let state = self.state.lock();
        let mut candidates: Vec<WorkItem> = state
            .items
            .values()
            .filter(|item| query.matches(item, now))
            .cloned()
            .collect();
        candidates.sort_by(|a, b| query.compare(a, b));
        candidates.truncate(query.limit);
        Ok(candidates)
    }

    async fn acquire_leases(&self, claims: &[LeaseClaim]) -> Result<Vec<bool>> {
        let mut state = self.state.lock();
        let mut results = Vec::with_capacity(claims.len());
        for claim in claims {
            let won = match state.items.get_mut(&claim.work_item_id) {
                Some(item) if lease_matches(item, &claim.expected) => {
                    item.lock_owner = Some(claim.lock_owner.clone());
                    item.lock_expiration_time = Some(claim.lock_expiration_time);
                    item.revision += 1;
                    true
                }
                _ => {
                    debug!(work_item_id = %claim.work_item_id, "Lease compare-and-set lost");
                    false
                }
            };
            results.push(won);
        }
        Ok(results)
    }

    async fn release_lease(&self, id: &str, expected: &LeaseFields) -> Result<bool> {
        let mut state = self.state.lock();
        match state.items.get_mut(id) {
            Some(item) if lease_matches(item, expected) => {
                item.lock_owner = None;
                item.lock_expiration_time = None;
                item.revision += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend_lease(
        &self,
        id: &str,
        expected: &LeaseFields,
        lock_expiration_time: DateTime<Utc>,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        match state.items.get_mut(id) {
            Some(item) if lease_matches(item, expected) => {
                item.lock_expiration_time = Some(lock_expiration_time);
                item.revision += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_failure(
        &self,
        expected: &LeaseFields,
        updated: &WorkItem,
        incident: Option<&Incident>,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        let applied = match state.items.get_mut(&updated.id) {
            Some(item) if lease_matches(item, expected) => {
                item.retries_remaining = updated.retries_remaining;
                item.due_date = updated.due_date;
                item.last_failure_reason = updated.last_failure_reason.clone();
                item.failed_attempts = updated.failed_attempts;
                item.lock_owner = None;
                item.lock_expiration_time = None;
                item.revision += 1;
                true
            }
            _ => false,
        };
        if applied {
            if let Some(incident) = incident {
                state.incidents.push(incident.clone());
            }
        }
        Ok(applied)
    }

    async fn remove(&self, id: &str, expected: &LeaseFields) -> Result<bool> {
        let mut state = self.state.lock();
        let matches = state
            .items
            .get(id)
            .is_some_and(|item| lease_matches(item, expected));
        if matches {
            state.items.remove(id);
            state.incidents.retain(|incident| incident.work_item_id != id);
        }
        Ok(matches)
    }

    async fn set_retries(&self, id: &str, retries: u32) -> Result<bool> {
        let mut state = self.state.lock();
        let found = match state.items.get_mut(id) {
            Some(item) => {
                item.retries_remaining = retries;
                item.revision += 1;
                true
            }
            None => false,
        };
        if found && retries > 0 {
            state.incidents.retain(|incident| incident.work_item_id != id);
        }
        Ok(found)
    }

    async fn open_incidents(&self) -> Result<Vec<Incident>> {
        Ok(self.state.lock().incidents.clone())
    }
}
