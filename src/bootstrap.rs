//! # Scheduler Bootstrap
//!
//! Wires one engine node: the job acquisition engine, the dispatch pool, the job executor
//! loop and the fetch-and-lock coordinator, all sharing one lease store and one clock.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::database::LeaseStore;
use crate::error::{Result, SchedulerError};
use crate::execution::{JobExecutor, JobHandler, WorkerDispatchPool};
use crate::external_task::{Authenticator, ExternalTaskService, FetchAndLockHandler, IdentityProvider};
use crate::models::{WorkItem, WorkItemKind};
use crate::orchestration::{JobAcquisition, RetryPolicy};

/// Running node; dropping it does not stop the background loops, call [`stop`](Self::stop)
#[derive(Debug, Clone)]
pub struct SchedulerSystem {
    node_id: String,
    default_retries: u32,
    store: Arc<dyn LeaseStore>,
    job_executor: JobExecutor,
    fetch_and_lock: FetchAndLockHandler,
}

impl SchedulerSystem {
    /// Build every component from `config` and start the background loops.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn bootstrap(
        config: &SchedulerConfig,
        store: Arc<dyn LeaseStore>,
        handler: Arc<dyn JobHandler>,
        identity: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let system = Self::build(config, store, handler, identity, clock)?;
        system.job_executor.start()?;
        system.fetch_and_lock.start()?;
        info!(
            node_id = %system.node_id,
            environment = %config.environment,
            "✅ Scheduler node started"
        );
        Ok(system)
    }

    /// Build every component without starting the loops
    pub fn build(
        config: &SchedulerConfig,
        store: Arc<dyn LeaseStore>,
        handler: Arc<dyn JobHandler>,
        identity: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let node_id = config.node.resolve_id();
        let retry_policy = RetryPolicy::from_config(&config.retry)
            .map_err(|e| SchedulerError::ConfigurationError(format!("retry: {e}")))?;

        let acquisition = JobAcquisition::new(
            store.clone(),
            clock.clone(),
            node_id.clone(),
            &config.job_acquisition,
        );
        let pool = WorkerDispatchPool::new(
            store.clone(),
            handler,
            retry_policy,
            clock.clone(),
            node_id.clone(),
            config.job_execution.clone(),
        );
        let job_executor = JobExecutor::new(acquisition, pool, &config.job_acquisition);

        let service = ExternalTaskService::new(
            store.clone(),
            clock.clone(),
            config.fetch_and_lock.overfetch_factor,
        );
        let authenticator = Authenticator::new(identity, &config.auth);
        let fetch_and_lock =
            FetchAndLockHandler::new(service, authenticator, clock, config.fetch_and_lock.clone());

        Ok(Self {
            node_id,
            default_retries: config.retry.default_retries,
            store,
            job_executor,
            fetch_and_lock,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }

    pub fn job_executor(&self) -> &JobExecutor {
        &self.job_executor
    }

    pub fn fetch_and_lock(&self) -> &FetchAndLockHandler {
        &self.fetch_and_lock
    }

    /// New job with the configured retry budget
    pub fn new_job(&self, id: impl Into<String>, due_date: DateTime<Utc>) -> WorkItem {
        WorkItem::job(id, due_date).with_retries(self.default_retries)
    }

    /// New external task with the configured retry budget
    pub fn new_external_task(
        &self,
        id: impl Into<String>,
        topic_name: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> WorkItem {
        WorkItem::external_task(id, topic_name, created_at).with_retries(self.default_retries)
    }

    /// Persist `item` and wake the loop that consumes it
    pub async fn schedule(&self, item: WorkItem) -> Result<()> {
        let kind = item.kind;
        self.store.insert(item).await?;
        match kind {
            WorkItemKind::Job => self.job_executor.hint_new_work(),
            WorkItemKind::ExternalTask => self.fetch_and_lock.notify_new_work(),
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.job_executor.is_running() || self.fetch_and_lock.is_running()
    }

    /// Stop both loops; pending long polls are rejected with `ShuttingDown`
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        let executor = self.job_executor.stop(timeout).await;
        let coordinator = self.fetch_and_lock.stop(timeout).await;

        if let Err(e) = &executor {
            error!(node_id = %self.node_id, error = %e, "Job executor did not stop cleanly");
        }
        if let Err(e) = &coordinator {
            error!(node_id = %self.node_id, error = %e, "Fetch-and-lock handler did not stop cleanly");
        }
        info!(node_id = %self.node_id, "🛑 Scheduler node stopped");
        executor.and(coordinator)
    }
}
