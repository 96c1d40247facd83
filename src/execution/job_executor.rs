//! # Job Executor
//!
//! The periodic acquisition loop of one engine node: acquire a cycle's worth of jobs,
//! hand the batches to the dispatch pool without waiting for them, sleep for whatever
//! the [`AcquisitionStrategy`] decides, repeat. A storage error only costs one cycle.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::worker_pool::{BatchReport, WorkerDispatchPool};
use crate::config::JobAcquisitionConfig;
use crate::error::{Result, SchedulerError};
use crate::logging::log_error;
use crate::orchestration::acquisition_strategy::{AcquisitionStrategy, CycleOutcome};
use crate::orchestration::job_acquisition::JobAcquisition;

#[derive(Debug)]
struct ExecutorState {
    acquisition: JobAcquisition,
    pool: WorkerDispatchPool,
    strategy: Mutex<AcquisitionStrategy>,
    max_jobs_per_acquisition: usize,
    running: AtomicBool,
    shutdown_notify: Notify,
    new_work: Notify,
}

#[derive(Debug, Clone)]
pub struct JobExecutor {
    state: Arc<ExecutorState>,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl JobExecutor {
    pub fn new(
        acquisition: JobAcquisition,
        pool: WorkerDispatchPool,
        config: &JobAcquisitionConfig,
    ) -> Self {
        Self {
            state: Arc::new(ExecutorState {
                acquisition,
                pool,
                strategy: Mutex::new(AcquisitionStrategy::new(config.clone())),
                max_jobs_per_acquisition: config.max_jobs_per_acquisition,
                running: AtomicBool::new(false),
                shutdown_notify: Notify::new(),
                new_work: Notify::new(),
            }),
            handle: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    pub fn pool(&self) -> &WorkerDispatchPool {
        &self.state.pool
    }

    /// Spawn the acquisition loop
    pub fn start(&self) -> Result<()> {
        if self
            .state
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SchedulerError::InvalidState(
                "Job executor is already running".to_string(),
            ));
        }

        let state = Arc::clone(&self.state);
        let handle = tokio::spawn(async move { state.run().await });
        *self.handle.lock() = Some(handle);
        info!(node_id = %self.state.acquisition.node_id(), "🚀 Job executor started");
        Ok(())
    }

    /// Stop the loop and wait up to `timeout` for it to exit.
    ///
    /// Batches already dispatched keep running to completion.
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        if !self.state.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.state.shutdown_notify.notify_one();

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            tokio::time::timeout(timeout, handle)
                .await
                .map_err(|_| SchedulerError::Timeout("Job executor stop timeout".to_string()))?
                .map_err(|e| SchedulerError::InvalidState(format!("Job executor task failed: {e}")))?;
        }
        info!(node_id = %self.state.acquisition.node_id(), "🛑 Job executor stopped");
        Ok(())
    }

    /// Wake the loop early, e.g. when the engine created a job that is due now
    pub fn hint_new_work(&self) {
        self.state.new_work.notify_one();
    }

    /// One acquire cycle; batches are dispatched without waiting for them
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        let (outcome, _) = self.state.acquire_and_dispatch(false).await?;
        Ok(outcome)
    }

    /// One acquire cycle that waits for every dispatched batch
    pub async fn run_cycle_and_wait(&self) -> Result<Vec<BatchReport>> {
        let (_, reports) = self.state.acquire_and_dispatch(true).await?;
        Ok(reports)
    }
}

impl ExecutorState {
    async fn acquire_and_dispatch(&self, wait: bool) -> Result<(CycleOutcome, Vec<BatchReport>)> {
        let requested = self
            .max_jobs_per_acquisition
            .min(self.pool.remaining_capacity());
        if requested == 0 {
            debug!("Dispatch pool saturated, skipping acquisition");
            let outcome = CycleOutcome::Completed {
                acquired: 0,
                requested: 0,
                lost_races: 0,
            };
            return Ok((outcome, Vec::new()));
        }

        let acquired = self.acquisition.acquire_cycle(requested).await?;
        let outcome = CycleOutcome::Completed {
            acquired: acquired.acquired_count(),
            requested,
            lost_races: acquired.lost_races,
        };

        let reports = if wait {
            self.pool.dispatch_and_wait(acquired.batches).await
        } else {
            let dispatched = self.pool.dispatch(acquired.batches).await;
            dispatched.rejected
        };
        Ok((outcome, reports))
    }

    async fn run(&self) {
        info!(node_id = %self.acquisition.node_id(), "Starting acquisition loop");

        while self.running.load(Ordering::Acquire) {
            let outcome = match self.acquire_and_dispatch(false).await {
                Ok((outcome, _)) => outcome,
                Err(e) => {
                    log_error("job_executor", "acquire_cycle", &e.to_string(), None);
                    CycleOutcome::Failed
                }
            };
            let wait = self.strategy.lock().next_wait(outcome);

            if wait.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(wait) => {},
                _ = self.new_work.notified() => {
                    debug!("New work hinted, acquiring early");
                },
                _ = self.shutdown_notify.notified() => {
                    // A permit left over from an earlier stop is ignored
                    if !self.running.load(Ordering::Acquire) {
                        debug!("Shutdown notification received");
                        break;
                    }
                }
            }
        }

        self.running.store(false, Ordering::Release);
        warn!(node_id = %self.acquisition.node_id(), "Acquisition loop ended");
    }
}
