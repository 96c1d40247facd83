//! Pull-side integration: the long-poll lifecycle of fetch-and-lock requests.

mod common;

use common::*;
use lease_core::clock::{Clock, SystemClock};
use lease_core::config::{AuthConfig, StaticUserConfig};
use lease_core::database::LeaseStore;
use lease_core::external_task::{
    Authenticator, Credentials, FetchAndLockError, FetchAndLockRequest, FetchTopic,
    InMemoryIdentityProvider, Submission,
};
use lease_core::models::WorkItem;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

fn queued(
    submission: Submission,
) -> (
    Uuid,
    oneshot::Receiver<lease_core::external_task::FetchAndLockResponse>,
) {
    match submission {
        Submission::Queued {
            request_id,
            receiver,
        } => (request_id, receiver),
        Submission::Resolved(tasks) => panic!("expected the request to be queued, got {tasks:?}"),
    }
}

#[tokio::test]
async fn test_timeout_bounds_are_enforced_before_queueing() {
    let handler = fetch_handler(memory_store(), manual_clock(), Authenticator::disabled());

    for timeout in [59_999, 1_800_001] {
        let err = handler
            .submit(long_poll("w1", "invoice", Some(timeout)), None)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchAndLockError::InvalidRequest(_)));
        assert_eq!(err.status_code(), 400);
    }
    assert_eq!(handler.pending_count(), 0);

    for timeout in [60_000, 1_800_000] {
        queued(
            handler
                .submit(long_poll("w1", "invoice", Some(timeout)), None)
                .await
                .unwrap(),
        );
    }
    assert_eq!(handler.pending_count(), 2);
}

#[tokio::test]
async fn test_immediate_hit_is_never_queued() {
    let store = memory_store();
    store
        .insert(WorkItem::external_task("t1", "invoice", t0()))
        .await
        .unwrap();
    let handler = fetch_handler(store, manual_clock(), Authenticator::disabled());

    let submission = handler
        .submit(long_poll("w1", "invoice", Some(60_000)), None)
        .await
        .unwrap();

    match submission {
        Submission::Resolved(tasks) => {
            assert_eq!(tasks.len(), 1);
            assert_eq!(tasks[0].id, "t1");
            assert_eq!(tasks[0].worker_id, "w1");
        }
        Submission::Queued { .. } => panic!("expected an immediate hit"),
    }
    assert_eq!(handler.pending_count(), 0);
}

#[tokio::test]
async fn test_without_timeout_polls_once() {
    let handler = fetch_handler(memory_store(), manual_clock(), Authenticator::disabled());

    let tasks = handler
        .handle(long_poll("w1", "invoice", None), None)
        .await
        .unwrap();

    assert!(tasks.is_empty());
    assert_eq!(handler.pending_count(), 0);
}

#[tokio::test]
async fn test_deadline_resolves_empty() {
    let clock = manual_clock();
    let handler = fetch_handler(memory_store(), clock.clone(), Authenticator::disabled());
    let (_, receiver) = queued(
        handler
            .submit(long_poll("w1", "invoice", Some(60_000)), None)
            .await
            .unwrap(),
    );

    clock.advance_millis(59_999);
    let report = handler.sweep().await;
    assert_eq!(report.expired, 0);
    assert_eq!(report.next_backoff, Some(Duration::from_millis(1)));

    clock.advance_millis(1);
    let report = handler.sweep().await;

    assert_eq!(report.expired, 1);
    assert_eq!(report.next_backoff, None);
    assert_eq!(receiver.await.unwrap(), Ok(Vec::new()));
    assert_eq!(handler.pending_count(), 0);
}

#[tokio::test]
async fn test_sweep_attempts_earlier_deadline_first() {
    let handler = fetch_handler(memory_store(), manual_clock(), Authenticator::disabled());
    let (late, _late_rx) = queued(
        handler
            .submit(long_poll("late", "invoice", Some(120_000)), None)
            .await
            .unwrap(),
    );
    let (early, _early_rx) = queued(
        handler
            .submit(long_poll("early", "invoice", Some(60_000)), None)
            .await
            .unwrap(),
    );

    let report = handler.sweep().await;

    assert_eq!(report.attempted, vec![early, late]);
    assert_eq!(report.next_backoff, Some(Duration::from_millis(6_000)));
}

#[tokio::test]
async fn test_earliest_deadline_wins_new_work() {
    let store = memory_store();
    let clock = manual_clock();
    let handler = fetch_handler(store.clone(), clock.clone(), Authenticator::disabled());
    let (_, late_rx) = queued(
        handler
            .submit(long_poll("late", "invoice", Some(120_000)), None)
            .await
            .unwrap(),
    );
    let (early, early_rx) = queued(
        handler
            .submit(long_poll("early", "invoice", Some(60_000)), None)
            .await
            .unwrap(),
    );

    store
        .insert(WorkItem::external_task("t1", "invoice", clock.now()))
        .await
        .unwrap();
    let report = handler.sweep().await;

    assert_eq!(report.resolved, 1);
    assert!(!handler.is_pending(early));
    let tasks = early_rx.await.unwrap().unwrap();
    assert_eq!(tasks[0].id, "t1");
    assert_eq!(tasks[0].worker_id, "early");
    assert_eq!(handler.pending_count(), 1);
    drop(late_rx);
}

#[tokio::test]
async fn test_unauthenticated_requests_are_rejected_and_never_queued() {
    let config = AuthConfig {
        enabled: true,
        realm: "engine".to_string(),
        users: vec![StaticUserConfig {
            id: "demo".to_string(),
            password: "secret".to_string(),
            ..Default::default()
        }],
    };
    let authenticator = Authenticator::new(
        Arc::new(InMemoryIdentityProvider::from_config(&config)),
        &config,
    );
    let handler = fetch_handler(memory_store(), manual_clock(), authenticator);
    let wrong = Credentials {
        user_id: "demo".to_string(),
        password: "guess".to_string(),
    }
    .to_authorization_header();

    for header in [None, Some("Basic garbage"), Some(wrong.as_str())] {
        let err = handler
            .submit(long_poll("w1", "invoice", Some(60_000)), header)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            FetchAndLockError::Unauthorized {
                realm: "engine".to_string()
            }
        );
        assert_eq!(err.status_code(), 401);
    }
    assert_eq!(handler.pending_count(), 0);

    let right = Credentials {
        user_id: "demo".to_string(),
        password: "secret".to_string(),
    }
    .to_authorization_header();
    queued(
        handler
            .submit(long_poll("w1", "invoice", Some(60_000)), Some(&right))
            .await
            .unwrap(),
    );
    assert_eq!(handler.pending_count(), 1);
}

#[tokio::test]
async fn test_abandoned_request_is_discarded_without_leasing() {
    let store = memory_store();
    let clock = manual_clock();
    let handler = fetch_handler(store.clone(), clock.clone(), Authenticator::disabled());
    let (_, receiver) = queued(
        handler
            .submit(long_poll("w1", "invoice", Some(60_000)), None)
            .await
            .unwrap(),
    );
    drop(receiver);
    store
        .insert(WorkItem::external_task("t1", "invoice", clock.now()))
        .await
        .unwrap();

    let report = handler.sweep().await;

    assert_eq!(report.discarded, 1);
    assert!(report.attempted.is_empty());
    let item = store.find("t1").await.unwrap().unwrap();
    assert_eq!(item.lock_owner, None);
}

#[tokio::test]
async fn test_lost_race_is_replaced_by_next_candidate() {
    let store = Arc::new(RacingStore::new());
    let clock = manual_clock();
    for id in ["t1", "t2"] {
        store
            .insert(WorkItem::external_task(id, "invoice", clock.now()))
            .await
            .unwrap();
    }
    store.contest("t1");
    let handler = fetch_handler(store.clone(), clock, Authenticator::disabled());

    let tasks = handler
        .handle(long_poll("w1", "invoice", None), None)
        .await
        .unwrap();

    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, "t2");
    let contested = store.find("t1").await.unwrap().unwrap();
    assert_eq!(contested.lock_owner.as_deref(), Some(RIVAL_NODE));
    assert_eq!(contested.retries_remaining, 3);
}

#[tokio::test]
async fn test_storage_failure_still_expires_requests() {
    let store = Arc::new(FailingStore::new());
    let clock = manual_clock();
    let handler = fetch_handler(store.clone(), clock.clone(), Authenticator::disabled());
    let (_, receiver) = queued(
        handler
            .submit(long_poll("w1", "invoice", Some(60_000)), None)
            .await
            .unwrap(),
    );
    store.set_failing(true);
    clock.advance_millis(60_000);

    let report = handler.sweep().await;

    assert!(report.storage_failure);
    assert_eq!(report.expired, 1);
    assert_eq!(receiver.await.unwrap(), Ok(Vec::new()));
}

#[tokio::test]
async fn test_stop_rejects_pending_requests() {
    let handler = fetch_handler(memory_store(), manual_clock(), Authenticator::disabled());
    handler.start().unwrap();
    let (_, receiver) = queued(
        handler
            .submit(long_poll("w1", "invoice", Some(60_000)), None)
            .await
            .unwrap(),
    );

    handler.stop(Duration::from_secs(1)).await.unwrap();

    assert_eq!(receiver.await.unwrap(), Err(FetchAndLockError::ShuttingDown));
    assert_eq!(handler.pending_count(), 0);
    let err = handler
        .submit(long_poll("w1", "invoice", Some(60_000)), None)
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 503);
}

#[tokio::test]
async fn test_background_loop_delivers_new_work() {
    let store = memory_store();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let handler = fetch_handler(store.clone(), clock.clone(), Authenticator::disabled());
    handler.start().unwrap();

    let waiting = {
        let handler = handler.clone();
        tokio::spawn(async move {
            let request = FetchAndLockRequest::new("w1", 2)
                .with_topic(FetchTopic::new("invoice", 10_000))
                .with_response_timeout(60_000);
            handler.handle(request, None).await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    store
        .insert(WorkItem::external_task("t1", "invoice", clock.now()))
        .await
        .unwrap();
    handler.notify_new_work();

    let tasks = tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .expect("long poll should resolve after new work")
        .unwrap()
        .unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, "t1");

    handler.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_stop_during_immediate_attempt_rejects_instead_of_parking() {
    let store = Arc::new(GatedStore::new());
    let handler = fetch_handler(store.clone(), manual_clock(), Authenticator::disabled());
    handler.start().unwrap();
    store.arm();

    let waiting = {
        let handler = handler.clone();
        tokio::spawn(async move {
            handler
                .handle(long_poll("w1", "invoice", Some(60_000)), None)
                .await
        })
    };
    store.wait_entered().await;

    handler.stop(Duration::from_secs(1)).await.unwrap();
    store.open();

    let result = tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .expect("request must not outlive the handler")
        .unwrap();
    assert_eq!(result, Err(FetchAndLockError::ShuttingDown));
    assert_eq!(handler.pending_count(), 0);
}

#[tokio::test]
async fn test_unbounded_lock_duration_is_rejected_before_leasing() {
    let store = memory_store();
    let clock = manual_clock();
    store
        .insert(WorkItem::external_task("t1", "invoice", clock.now()))
        .await
        .unwrap();
    let handler = fetch_handler(store.clone(), clock.clone(), Authenticator::disabled());

    for lock in [u64::MAX, 10_000_000_000_000_000] {
        let request = FetchAndLockRequest::new("w1", 1)
            .with_topic(FetchTopic::new("invoice", lock))
            .with_response_timeout(60_000);
        let err = handler.submit(request, None).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
    }
    assert_eq!(handler.pending_count(), 0);
    assert_eq!(store.find("t1").await.unwrap().unwrap().lock_owner, None);

    let first = handler
        .handle(long_poll("w1", "invoice", None), None)
        .await
        .unwrap();
    assert_eq!(first.len(), 1);
    assert!(first[0].lock_expiration_time > clock.now());
    let second = handler
        .handle(long_poll("w2", "invoice", None), None)
        .await
        .unwrap();
    assert!(second.is_empty());
}
