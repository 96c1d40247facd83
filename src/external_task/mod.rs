//! # External Tasks
//!
//! Pull-based leasing for external workers: the fetch-and-lock long-poll protocol, its
//! authentication, and the worker-side operations on leased tasks.

pub mod auth;
pub mod dto;
pub mod error;
pub mod fetch_and_lock_handler;
pub mod pending_requests;
pub mod service;

pub use auth::{
    Authentication, AuthenticationError, Authenticator, Credentials, IdentityProvider,
    InMemoryIdentityProvider,
};
pub use dto::{
    FetchAndLockRequest, FetchTopic, LockedExternalTask, MAX_LOCK_DURATION_MILLIS,
    MAX_RESPONSE_TIMEOUT_MILLIS, MIN_RESPONSE_TIMEOUT_MILLIS,
};
pub use error::FetchAndLockError;
pub use fetch_and_lock_handler::{poll_backoff, FetchAndLockHandler, Submission, SweepReport};
pub use pending_requests::{FetchAndLockResponse, PendingRequest, PendingRequestQueue};
pub use service::ExternalTaskService;
