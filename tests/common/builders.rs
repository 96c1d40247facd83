use chrono::{DateTime, TimeZone, Utc};
use lease_core::clock::{Clock, ManualClock};
use lease_core::config::{FetchAndLockConfig, JobAcquisitionConfig, JobExecutionConfig};
use lease_core::database::{InMemoryLeaseStore, LeaseStore};
use lease_core::execution::{JobHandler, WorkerDispatchPool};
use lease_core::external_task::{
    Authenticator, ExternalTaskService, FetchAndLockHandler, FetchAndLockRequest, FetchTopic,
};
use lease_core::orchestration::{JobAcquisition, RetryPolicy};
use std::sync::Arc;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(t0()))
}

pub fn memory_store() -> Arc<InMemoryLeaseStore> {
    Arc::new(InMemoryLeaseStore::new())
}

pub fn acquisition(
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    node_id: &str,
    lock_time_in_millis: u64,
) -> JobAcquisition {
    let config = JobAcquisitionConfig {
        lock_time_in_millis,
        ..Default::default()
    };
    JobAcquisition::new(store, clock, node_id, &config)
}

pub fn dispatch_pool(
    store: Arc<dyn LeaseStore>,
    handler: Arc<dyn JobHandler>,
    clock: Arc<dyn Clock>,
    node_id: &str,
    config: JobExecutionConfig,
) -> WorkerDispatchPool {
    let policy = RetryPolicy::new(lease_core::orchestration::BackoffStrategy::Fixed {
        delay_millis: 1_000,
    });
    WorkerDispatchPool::new(store, handler, policy, clock, node_id, config)
}

pub fn fetch_handler(
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    authenticator: Authenticator,
) -> FetchAndLockHandler {
    let config = FetchAndLockConfig::default();
    let service = ExternalTaskService::new(store, clock.clone(), config.overfetch_factor);
    FetchAndLockHandler::new(service, authenticator, clock, config)
}

pub fn long_poll(worker_id: &str, topic: &str, timeout_millis: Option<u64>) -> FetchAndLockRequest {
    FetchAndLockRequest {
        response_timeout_millis: timeout_millis,
        ..FetchAndLockRequest::new(worker_id, 1).with_topic(FetchTopic::new(topic, 30_000))
    }
}
