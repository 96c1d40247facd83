//! # Pending Request Queue
//!
//! Node-local queue of long-poll requests waiting for work, ordered by deadline. New
//! arrivals are appended while the coordinator sweeps: the sweep iterates a snapshot and
//! removes entries by id, so a concurrent insert never invalidates its iteration.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::auth::Authentication;
use super::dto::{FetchAndLockRequest, LockedExternalTask};
use super::error::FetchAndLockError;

pub type FetchAndLockResponse = Result<Vec<LockedExternalTask>, FetchAndLockError>;

#[derive(Debug)]
pub struct PendingRequest {
    pub id: Uuid,
    pub request: FetchAndLockRequest,
    pub authentication: Option<Authentication>,
    pub request_time: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    responder: oneshot::Sender<FetchAndLockResponse>,
}

impl PendingRequest {
    pub fn new(
        request: FetchAndLockRequest,
        authentication: Option<Authentication>,
        request_time: DateTime<Utc>,
        deadline: DateTime<Utc>,
        responder: oneshot::Sender<FetchAndLockResponse>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            authentication,
            request_time,
            deadline,
            responder,
        }
    }

    /// The caller stopped waiting
    pub fn is_abandoned(&self) -> bool {
        self.responder.is_closed()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline <= now
    }

    /// Deliver the response; gives it back when the caller is gone
    pub fn resolve(self, response: FetchAndLockResponse) -> Result<(), FetchAndLockResponse> {
        self.responder.send(response)
    }
}

/// What the sweep needs to attempt a lease without holding the queue lock
#[derive(Debug, Clone)]
pub struct PendingSnapshot {
    pub id: Uuid,
    pub request: FetchAndLockRequest,
    pub authentication: Option<Authentication>,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Entries {
    pending: Vec<PendingRequest>,
    closed: bool,
}

/// Deadline-ordered pending requests; closed for good by [`drain`](Self::drain)
#[derive(Debug, Default)]
pub struct PendingRequestQueue {
    entries: Mutex<Entries>,
}

impl PendingRequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert keeping deadline order; equal deadlines stay in arrival order.
    ///
    /// Gives the request back once the queue has been drained for shutdown.
    pub fn insert(&self, pending: PendingRequest) -> Result<(), PendingRequest> {
        let mut entries = self.entries.lock();
        if entries.closed {
            return Err(pending);
        }
        let position = entries
            .pending
            .partition_point(|entry| entry.deadline <= pending.deadline);
        entries.pending.insert(position, pending);
        Ok(())
    }

    /// Current entries in deadline order
    pub fn snapshot(&self) -> Vec<PendingSnapshot> {
        self.entries
            .lock()
            .pending
            .iter()
            .map(|entry| PendingSnapshot {
                id: entry.id,
                request: entry.request.clone(),
                authentication: entry.authentication.clone(),
                deadline: entry.deadline,
            })
            .collect()
    }

    pub fn take(&self, id: Uuid) -> Option<PendingRequest> {
        let mut entries = self.entries.lock();
        let position = entries.pending.iter().position(|entry| entry.id == id)?;
        Some(entries.pending.remove(position))
    }

    /// Remove and return every entry whose caller has gone away
    pub fn remove_abandoned(&self) -> Vec<PendingRequest> {
        let mut entries = self.entries.lock();
        let (abandoned, kept): (Vec<_>, Vec<_>) = entries
            .pending
            .drain(..)
            .partition(PendingRequest::is_abandoned);
        entries.pending = kept;
        abandoned
    }

    pub fn earliest_deadline(&self) -> Option<DateTime<Utc>> {
        self.entries.lock().pending.first().map(|entry| entry.deadline)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.entries.lock().pending.iter().any(|entry| entry.id == id)
    }

    /// Take every entry and refuse later inserts
    pub fn drain(&self) -> Vec<PendingRequest> {
        let mut entries = self.entries.lock();
        entries.closed = true;
        std::mem::take(&mut entries.pending)
    }

    pub fn is_closed(&self) -> bool {
        self.entries.lock().closed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().pending.is_empty()
    }
}
