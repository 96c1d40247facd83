//! # Fetch-and-Lock Coordinator
//!
//! Long-poll entry point for external workers. A request is validated and authenticated,
//! then gets one immediate lease attempt. When that finds nothing and the caller asked to
//! wait, the request is parked in the [`PendingRequestQueue`] and one background loop per
//! node retries all parked requests until they receive work or reach their deadline.
//!
//! ```text
//! ARRIVED -> AUTHENTICATED -> IMMEDIATE_HIT ----------> RESOLVED
//!    |             |       \-> QUEUED -> (sweep) -----> RESOLVED (items | empty on deadline)
//!    \-------------+------------------------------------> REJECTED (invalid | unauthorized)
//! ```

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::auth::Authenticator;
use super::dto::{FetchAndLockRequest, LockedExternalTask};
use super::error::FetchAndLockError;
use super::pending_requests::{FetchAndLockResponse, PendingRequest, PendingRequestQueue};
use super::service::ExternalTaskService;
use crate::clock::Clock;
use crate::config::FetchAndLockConfig;
use crate::error::{Result, SchedulerError};
use crate::logging::{log_error, log_long_poll_event};

/// Result of submitting a request
#[derive(Debug)]
pub enum Submission {
    /// Answered without queueing
    Resolved(Vec<LockedExternalTask>),
    /// Parked until work arrives or the deadline passes
    Queued {
        request_id: Uuid,
        receiver: oneshot::Receiver<FetchAndLockResponse>,
    },
}

/// What one sweep over the pending queue did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    /// Requests answered with at least one task
    pub resolved: usize,
    /// Requests answered empty at their deadline
    pub expired: usize,
    /// Requests dropped because the caller went away
    pub discarded: usize,
    /// Requests a lease was attempted for, in attempt order
    pub attempted: Vec<Uuid>,
    /// Whether a storage failure cut the lease attempts short
    pub storage_failure: bool,
    /// Sleep before the next sweep; `None` waits for a new arrival
    pub next_backoff: Option<Duration>,
}

/// Poll interval for the smallest remaining slack.
///
/// Polls at `slack / divisor`, clamped to `[min_backoff, default_backoff]` while the slack
/// is within `default_backoff * divisor`, and never sleeps past the deadline itself.
pub fn poll_backoff(slack_millis: u64, config: &FetchAndLockConfig) -> u64 {
    let divisor = config.backoff_divisor.max(1);
    let fraction = slack_millis / divisor;
    let backoff = if slack_millis <= config.default_backoff_millis.saturating_mul(divisor) {
        fraction.clamp(
            config.min_backoff_millis.min(config.default_backoff_millis),
            config.default_backoff_millis,
        )
    } else {
        fraction
    };
    backoff.min(slack_millis)
}

#[derive(Debug)]
struct HandlerState {
    service: ExternalTaskService,
    authenticator: Authenticator,
    queue: PendingRequestQueue,
    clock: Arc<dyn Clock>,
    config: FetchAndLockConfig,
    running: AtomicBool,
    shutting_down: AtomicBool,
    wake: Notify,
    shutdown_notify: Notify,
}

#[derive(Debug, Clone)]
pub struct FetchAndLockHandler {
    state: Arc<HandlerState>,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl FetchAndLockHandler {
    pub fn new(
        service: ExternalTaskService,
        authenticator: Authenticator,
        clock: Arc<dyn Clock>,
        config: FetchAndLockConfig,
    ) -> Self {
        Self {
            state: Arc::new(HandlerState {
                service,
                authenticator,
                queue: PendingRequestQueue::new(),
                clock,
                config,
                running: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                wake: Notify::new(),
                shutdown_notify: Notify::new(),
            }),
            handle: Arc::new(Mutex::new(None)),
        }
    }

    pub fn service(&self) -> &ExternalTaskService {
        &self.state.service
    }

    pub fn pending_count(&self) -> usize {
        self.state.queue.len()
    }

    pub fn is_pending(&self, request_id: Uuid) -> bool {
        self.state.queue.contains(request_id)
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    /// Handle a request end to end, waiting for the long poll to finish
    pub async fn handle(
        &self,
        request: FetchAndLockRequest,
        authorization_header: Option<&str>,
    ) -> FetchAndLockResponse {
        match self.submit(request, authorization_header).await? {
            Submission::Resolved(tasks) => Ok(tasks),
            Submission::Queued { receiver, .. } => receiver
                .await
                .unwrap_or(Err(FetchAndLockError::ShuttingDown)),
        }
    }

    /// Validate, authenticate and attempt once; park the request when it should wait
    pub async fn submit(
        &self,
        request: FetchAndLockRequest,
        authorization_header: Option<&str>,
    ) -> std::result::Result<Submission, FetchAndLockError> {
        if self.state.shutting_down.load(Ordering::Acquire) {
            return Err(FetchAndLockError::ShuttingDown);
        }
        request.validate()?;
        let authentication = self
            .state
            .authenticator
            .authenticate(authorization_header)
            .await?;

        let request_time = self.state.clock.now();
        let tasks = self
            .state
            .service
            .fetch_and_lock(&request, authentication.as_ref())
            .await?;

        let timeout_millis = match request.response_timeout_millis {
            Some(timeout) if tasks.is_empty() => timeout,
            _ => {
                debug!(
                    worker_id = %request.worker_id,
                    items = tasks.len(),
                    "Fetch-and-lock answered immediately"
                );
                return Ok(Submission::Resolved(tasks));
            }
        };

        let (responder, receiver) = oneshot::channel();
        let deadline = request_time + chrono::Duration::milliseconds(timeout_millis as i64);
        let pending = PendingRequest::new(
            request,
            authentication,
            request_time,
            deadline,
            responder,
        );
        let request_id = pending.id;
        let worker_id = pending.request.worker_id.clone();
        if self.state.queue.insert(pending).is_err() {
            // stop() drained the queue while this request was attempting its lease
            log_long_poll_event(
                "rejected",
                &request_id.to_string(),
                &worker_id,
                0,
                Some("shutting down"),
            );
            return Err(FetchAndLockError::ShuttingDown);
        }
        log_long_poll_event(
            "queued",
            &request_id.to_string(),
            &worker_id,
            0,
            Some(&format!("deadline={}", deadline.to_rfc3339())),
        );
        self.state.wake.notify_one();

        Ok(Submission::Queued {
            request_id,
            receiver,
        })
    }

    /// Wake the sweep early, e.g. after the engine created external tasks
    pub fn notify_new_work(&self) {
        self.state.wake.notify_one();
    }

    /// One pass over the pending queue
    pub async fn sweep(&self) -> SweepReport {
        self.state.sweep().await
    }

    /// Spawn the coordinator loop
    pub fn start(&self) -> Result<()> {
        if self.state.shutting_down.load(Ordering::Acquire) {
            return Err(SchedulerError::ShuttingDown);
        }
        if self
            .state
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SchedulerError::InvalidState(
                "Fetch-and-lock handler is already running".to_string(),
            ));
        }

        let state = Arc::clone(&self.state);
        let handle = tokio::spawn(async move { state.run().await });
        *self.handle.lock() = Some(handle);
        info!("🚀 Fetch-and-lock handler started");
        Ok(())
    }

    /// Stop the loop and reject every pending request with `ShuttingDown`
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        self.state.shutting_down.store(true, Ordering::Release);
        if self.state.running.swap(false, Ordering::AcqRel) {
            self.state.shutdown_notify.notify_one();
        }

        let handle = self.handle.lock().take();
        let joined = match handle {
            Some(handle) => tokio::time::timeout(timeout, handle)
                .await
                .map_err(|_| SchedulerError::Timeout("Fetch-and-lock stop timeout".to_string()))
                .and_then(|joined| {
                    joined.map_err(|e| {
                        SchedulerError::InvalidState(format!("Fetch-and-lock task failed: {e}"))
                    })
                }),
            None => Ok(()),
        };

        let rejected = self.state.reject_all_pending();
        info!(rejected = rejected, "🛑 Fetch-and-lock handler stopped");
        joined
    }
}

impl HandlerState {
    async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for abandoned in self.queue.remove_abandoned() {
            log_long_poll_event(
                "discarded",
                &abandoned.id.to_string(),
                &abandoned.request.worker_id,
                0,
                Some("caller gone"),
            );
            report.discarded += 1;
        }

        let now = self.clock.now();
        for snapshot in self.queue.snapshot() {
            let expired = snapshot.deadline <= now;

            if !report.storage_failure {
                report.attempted.push(snapshot.id);
                match self
                    .service
                    .fetch_and_lock(&snapshot.request, snapshot.authentication.as_ref())
                    .await
                {
                    Ok(tasks) if !tasks.is_empty() => {
                        self.deliver(snapshot.id, tasks, &mut report).await;
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log_error(
                            "fetch_and_lock_handler",
                            "sweep",
                            &e.to_string(),
                            Some(&snapshot.request.worker_id),
                        );
                        report.storage_failure = true;
                    }
                }
            }

            if expired {
                if let Some(pending) = self.queue.take(snapshot.id) {
                    let worker_id = pending.request.worker_id.clone();
                    if pending.resolve(Ok(Vec::new())).is_ok() {
                        log_long_poll_event("expired", &snapshot.id.to_string(), &worker_id, 0, None);
                        report.expired += 1;
                    } else {
                        report.discarded += 1;
                    }
                }
            }
        }

        report.next_backoff = self.next_backoff(self.clock.now());
        debug!(
            resolved = report.resolved,
            expired = report.expired,
            discarded = report.discarded,
            pending = self.queue.len(),
            "Fetch-and-lock sweep finished"
        );
        report
    }

    async fn deliver(&self, id: Uuid, tasks: Vec<LockedExternalTask>, report: &mut SweepReport) {
        let count = tasks.len();
        let undelivered = match self.queue.take(id) {
            Some(pending) => {
                let worker_id = pending.request.worker_id.clone();
                match pending.resolve(Ok(tasks)) {
                    Ok(()) => {
                        log_long_poll_event("resolved", &id.to_string(), &worker_id, count, None);
                        report.resolved += 1;
                        return;
                    }
                    Err(response) => {
                        report.discarded += 1;
                        response.unwrap_or_default()
                    }
                }
            }
            // Resolved by a concurrent sweep or rejected by stop()
            None => tasks,
        };

        if let Err(e) = self.service.release(&undelivered).await {
            log_error(
                "fetch_and_lock_handler",
                "release",
                &e.to_string(),
                Some(&id.to_string()),
            );
        }
    }

    fn next_backoff(&self, now: DateTime<Utc>) -> Option<Duration> {
        let deadline = self.queue.earliest_deadline()?;
        let slack_millis = (deadline - now).num_milliseconds().max(0) as u64;
        Some(Duration::from_millis(poll_backoff(slack_millis, &self.config)))
    }

    fn reject_all_pending(&self) -> usize {
        let drained = self.queue.drain();
        let count = drained.len();
        for pending in drained {
            let _ = pending.resolve(Err(FetchAndLockError::ShuttingDown));
        }
        count
    }

    async fn run(&self) {
        info!("Starting fetch-and-lock sweep loop");

        while self.running.load(Ordering::Acquire) {
            let report = self.sweep().await;

            match report.next_backoff {
                Some(backoff) => {
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {},
                        _ = self.wake.notified() => {},
                        _ = self.shutdown_notify.notified() => {},
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.wake.notified() => {},
                        _ = self.shutdown_notify.notified() => {},
                    }
                }
            }
        }

        warn!("Fetch-and-lock sweep loop ended");
    }
}
