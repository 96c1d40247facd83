//! # Job Acquisition
//!
//! ## Architecture: Optimistic Leasing Across Engine Nodes
//!
//! Every node runs the same acquire cycle against the shared [`LeaseStore`]:
//!
//! 1. select up to `max_items` leasable jobs (priority desc, due date asc, id asc)
//! 2. claim them all in one atomic [`LeaseStore::acquire_leases`] call, each claim
//!    conditioned on the lease fields read in step 1
//! 3. drop the claims another node won; they are picked up again next cycle
//! 4. group the leased jobs into exclusivity batches
//!
//! A storage error in step 1 or 2 aborts the cycle with nothing committed.

use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::exclusivity::{group_into_batches, ExclusivityScope, LeaseBatch};
use crate::clock::Clock;
use crate::config::JobAcquisitionConfig;
use crate::database::{LeaseClaim, LeaseStore};
use crate::error::{Result, SchedulerError};
use crate::logging::log_acquisition_cycle;
use crate::models::WorkItem;

/// Result of one acquire cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AcquiredJobs {
    pub batches: Vec<LeaseBatch>,
    /// Candidates returned by the selection
    pub selected: usize,
    /// Claims lost to another node
    pub lost_races: usize,
}

impl AcquiredJobs {
    pub fn acquired_count(&self) -> usize {
        self.batches.iter().map(LeaseBatch::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Ids of every leased job, batch by batch
    pub fn job_ids(&self) -> Vec<&str> {
        self.batches.iter().flat_map(LeaseBatch::ids).collect()
    }
}

#[derive(Debug, Clone)]
pub struct JobAcquisition {
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    node_id: String,
    lock_time_in_millis: u64,
    exclusivity_scope: ExclusivityScope,
}

impl JobAcquisition {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        clock: Arc<dyn Clock>,
        node_id: impl Into<String>,
        config: &JobAcquisitionConfig,
    ) -> Self {
        Self {
            store,
            clock,
            node_id: node_id.into(),
            lock_time_in_millis: config.lock_time_in_millis,
            exclusivity_scope: config.exclusivity_scope,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }

    /// Lease up to `max_items` due jobs for this node and batch them by exclusivity key
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn acquire_cycle(&self, max_items: usize) -> Result<AcquiredJobs> {
        if max_items == 0 {
            return Ok(AcquiredJobs::default());
        }

        let now = self.clock.now();
        let candidates = self.store.select_acquirable_jobs(now, max_items).await?;
        if candidates.is_empty() {
            debug!("No acquirable jobs");
            return Ok(AcquiredJobs::default());
        }

        let lock_expiration_time = WorkItem::lease_expiration(now, self.lock_time_in_millis)?;
        let claims: Vec<LeaseClaim> = candidates
            .iter()
            .map(|item| LeaseClaim::for_item(item, &self.node_id, lock_expiration_time))
            .collect();

        let results = self.store.acquire_leases(&claims).await?;
        if results.len() != claims.len() {
            return Err(SchedulerError::InvalidState(format!(
                "Lease store answered {} of {} claims",
                results.len(),
                claims.len()
            )));
        }

        let mut lost_races = 0;
        let mut leased = Vec::with_capacity(candidates.len());
        for ((item, claim), won) in candidates.iter().zip(&claims).zip(results) {
            if won {
                leased.push(claim.apply_to(item));
            } else {
                lost_races += 1;
            }
        }

        let selected = candidates.len();
        let acquired = leased.len();
        let batches = group_into_batches(leased, self.exclusivity_scope);

        log_acquisition_cycle(&self.node_id, selected, acquired, lost_races, batches.len());
        if lost_races > 0 {
            info!(
                lost_races = lost_races,
                "Jobs leased by another node during this cycle"
            );
        }

        Ok(AcquiredJobs {
            batches,
            selected,
            lost_races,
        })
    }
}
