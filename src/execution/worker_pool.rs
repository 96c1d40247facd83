//! # Worker Dispatch Pool
//!
//! Runs the batches of an acquisition cycle. Batches run concurrently with each other up
//! to `max_concurrent_batches`; the items of one batch run strictly in order.
//!
//! For each item the pool:
//!
//! 1. re-reads it and skips it as [`ItemOutcome::LeaseLost`] unless this node still holds
//!    the lease it acquired
//! 2. hands it to the [`JobHandler`], bounded by the execution timeout when configured
//! 3. deletes it on success, or applies the [`RetryPolicy`] on failure
//!
//! Every store write is conditioned on the lease, so an item whose lease expired and was
//! re-acquired elsewhere is never overwritten.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::job_handler::{JobExecutionError, JobHandler};
use crate::clock::Clock;
use crate::config::JobExecutionConfig;
use crate::database::LeaseStore;
use crate::logging::log_lease_operation;
use crate::models::WorkItem;
use crate::orchestration::exclusivity::LeaseBatch;
use crate::orchestration::retry_policy::{RetryOutcome, RetryPolicy};

#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    /// Executed and removed
    Completed,
    /// Failed with retries left
    Rescheduled { due_date: DateTime<Utc> },
    /// Failed with no retries left
    Incident,
    /// This node no longer held the lease
    LeaseLost,
    /// Not executed because an earlier item of the batch failed; lease released
    Skipped,
    /// Not executed because the pool was full; lease released
    Rejected,
    StorageError(String),
    /// Failed, but the retry delay put the due date out of range; lease left to expire
    Unschedulable(String),
}

impl ItemOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ItemOutcome::Rescheduled { .. } | ItemOutcome::Incident | ItemOutcome::Unschedulable(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemReport {
    pub work_item_id: String,
    pub outcome: ItemOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    pub exclusivity_key: Option<String>,
    pub items: Vec<ItemReport>,
}

impl BatchReport {
    pub fn outcomes(&self) -> Vec<&ItemOutcome> {
        self.items.iter().map(|item| &item.outcome).collect()
    }
}

/// Batches handed off by [`WorkerDispatchPool::dispatch`]
#[derive(Debug)]
pub struct Dispatched {
    pub handles: Vec<JoinHandle<BatchReport>>,
    /// Batches refused because the pool was full
    pub rejected: Vec<BatchReport>,
}

#[derive(Debug)]
struct PoolInner {
    store: Arc<dyn LeaseStore>,
    handler: Arc<dyn JobHandler>,
    retry_policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    node_id: String,
    config: JobExecutionConfig,
    semaphore: Arc<Semaphore>,
    in_flight: AtomicUsize,
}

/// Decrements the in-flight count when a batch task ends, even by panic
struct InFlightGuard(Arc<PoolInner>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone)]
pub struct WorkerDispatchPool {
    inner: Arc<PoolInner>,
}

impl WorkerDispatchPool {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        handler: Arc<dyn JobHandler>,
        retry_policy: RetryPolicy,
        clock: Arc<dyn Clock>,
        node_id: impl Into<String>,
        config: JobExecutionConfig,
    ) -> Self {
        let permits = config.max_concurrent_batches.max(1);
        Self {
            inner: Arc::new(PoolInner {
                store,
                handler,
                retry_policy,
                clock,
                node_id: node_id.into(),
                semaphore: Arc::new(Semaphore::new(permits)),
                in_flight: AtomicUsize::new(0),
                config,
            }),
        }
    }

    /// Batches accepted and not yet finished, running or waiting for a permit
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Batches that can be accepted right now
    pub fn remaining_capacity(&self) -> usize {
        self.capacity().saturating_sub(self.in_flight())
    }

    fn capacity(&self) -> usize {
        self.inner.config.max_concurrent_batches.max(1) + self.inner.config.queue_capacity
    }

    fn try_reserve(&self) -> bool {
        let capacity = self.capacity();
        self.inner
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < capacity).then_some(current + 1)
            })
            .is_ok()
    }

    /// Submit every batch independently.
    ///
    /// Batches beyond the pool's capacity are rejected and their leases released so the
    /// jobs can be acquired again.
    pub async fn dispatch(&self, batches: Vec<LeaseBatch>) -> Dispatched {
        let mut handles = Vec::with_capacity(batches.len());
        let mut rejected = Vec::new();

        for batch in batches {
            if !self.try_reserve() {
                warn!(
                    node_id = %self.inner.node_id,
                    batch_size = batch.len(),
                    "Dispatch pool full, releasing batch"
                );
                rejected.push(self.inner.release_batch(batch, ItemOutcome::Rejected).await);
                continue;
            }

            let inner = Arc::clone(&self.inner);
            let semaphore = Arc::clone(&self.inner.semaphore);
            handles.push(tokio::spawn(async move {
                let _guard = InFlightGuard(Arc::clone(&inner));
                match semaphore.acquire_owned().await {
                    Ok(_permit) => inner.run_batch(batch).await,
                    Err(_) => inner.release_batch(batch, ItemOutcome::Rejected).await,
                }
            }));
        }

        Dispatched { handles, rejected }
    }

    /// Dispatch and wait for every batch to finish
    pub async fn dispatch_and_wait(&self, batches: Vec<LeaseBatch>) -> Vec<BatchReport> {
        let Dispatched { handles, rejected } = self.dispatch(batches).await;
        let mut reports = Vec::with_capacity(handles.len() + rejected.len());
        for joined in join_all(handles).await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => error!(error = %e, "Batch task panicked or was cancelled"),
            }
        }
        reports.extend(rejected);
        reports
    }

    /// Close the pool; batches still waiting for a permit release their leases
    pub fn close(&self) {
        self.inner.semaphore.close();
    }
}

impl PoolInner {
    async fn run_batch(&self, batch: LeaseBatch) -> BatchReport {
        let mut items = Vec::with_capacity(batch.items.len());
        let mut aborted = false;

        for item in batch.items {
            let outcome = if aborted {
                self.release_item(&item).await;
                ItemOutcome::Skipped
            } else {
                self.execute_item(&item).await
            };

            if outcome.is_failure() && !self.config.continue_batch_on_failure {
                aborted = true;
            }
            items.push(ItemReport {
                work_item_id: item.id,
                outcome,
            });
        }

        BatchReport {
            exclusivity_key: batch.exclusivity_key,
            items,
        }
    }

    async fn release_batch(&self, batch: LeaseBatch, outcome: ItemOutcome) -> BatchReport {
        let mut items = Vec::with_capacity(batch.items.len());
        for item in batch.items {
            self.release_item(&item).await;
            items.push(ItemReport {
                work_item_id: item.id,
                outcome: outcome.clone(),
            });
        }
        BatchReport {
            exclusivity_key: batch.exclusivity_key,
            items,
        }
    }

    async fn release_item(&self, item: &WorkItem) {
        match self.store.release_lease(&item.id, &item.lease_fields()).await {
            Ok(true) => log_lease_operation("release", &item.id, Some(&self.node_id), "released", None),
            Ok(false) => debug!(work_item_id = %item.id, "Lease already gone, nothing to release"),
            Err(e) => error!(work_item_id = %item.id, error = %e, "Failed to release lease"),
        }
    }

    async fn execute_item(&self, leased: &WorkItem) -> ItemOutcome {
        let current = match self.store.find(&leased.id).await {
            Ok(Some(current))
                if current.revision == leased.revision
                    && current.is_locked_by(&self.node_id, self.clock.now()) =>
            {
                current
            }
            Ok(_) => {
                warn!(work_item_id = %leased.id, node_id = %self.node_id, "Lease lost before execution");
                return ItemOutcome::LeaseLost;
            }
            Err(e) => return ItemOutcome::StorageError(e.to_string()),
        };

        let result = match self.config.execution_timeout_millis {
            Some(millis) => {
                match tokio::time::timeout(
                    Duration::from_millis(millis),
                    self.handler.execute(&current),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(JobExecutionError::TimedOut(millis)),
                }
            }
            None => self.handler.execute(&current).await,
        };

        let expected = current.lease_fields();
        match result {
            Ok(()) => match self.store.remove(&current.id, &expected).await {
                Ok(true) => {
                    debug!(work_item_id = %current.id, "Job completed");
                    ItemOutcome::Completed
                }
                Ok(false) => ItemOutcome::LeaseLost,
                Err(e) => ItemOutcome::StorageError(e.to_string()),
            },
            Err(failure) => {
                let message = failure.to_string();
                let decision = match self
                    .retry_policy
                    .on_failure(&current, &message, self.clock.now())
                {
                    Ok(decision) => decision,
                    Err(e) => {
                        error!(
                            work_item_id = %current.id,
                            error = %e,
                            "Retry could not be scheduled, lease left to expire"
                        );
                        return ItemOutcome::Unschedulable(e.to_string());
                    }
                };
                match self
                    .store
                    .record_failure(&expected, &decision.updated, decision.incident())
                    .await
                {
                    Ok(true) => match decision.outcome {
                        RetryOutcome::Rescheduled { due_date, .. } => {
                            info!(
                                work_item_id = %current.id,
                                retries_remaining = decision.updated.retries_remaining,
                                due_date = %due_date,
                                error = %message,
                                "Job failed, rescheduled"
                            );
                            ItemOutcome::Rescheduled { due_date }
                        }
                        RetryOutcome::Incident(_) => {
                            log_lease_operation(
                                "incident",
                                &current.id,
                                Some(&self.node_id),
                                "retries exhausted",
                                Some(&message),
                            );
                            ItemOutcome::Incident
                        }
                    },
                    Ok(false) => ItemOutcome::LeaseLost,
                    Err(e) => ItemOutcome::StorageError(e.to_string()),
                }
            }
        }
    }
}
