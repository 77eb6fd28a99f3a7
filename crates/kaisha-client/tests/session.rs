//! Session runtime tests against the in-memory server.
//!
//! Each test drives a real actor over [`MemoryServer`], with server latency
//! holding responses open long enough for pushes and later requests to race
//! the round trip.

use std::sync::Arc;
use std::time::Duration;

use kaisha_cache::{CacheError, ConflictPolicy, FailureReason, SessionState};
use kaisha_client::constants::PUSH_CHANNEL_CAPACITY;
use kaisha_client::{
    Fault, MemoryServer, SessionConfig, SessionError, SessionEvent, SessionHandle, spawn_session,
};
use kaisha_types::{Company, CompanyId, MutationKind, OperationId, ValidationError};
use tokio::sync::broadcast;

// ============================================================================
// Shared test setup
// ============================================================================

const EVENT_WAIT: Duration = Duration::from_secs(2);

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Start a session over `server` and wait for the first fetch.
async fn live_session(server: &Arc<MemoryServer>, config: SessionConfig) -> SessionHandle {
    init_tracing();
    let handle = spawn_session(server.clone(), config);
    handle.refresh().await.expect("initial fetch");
    handle
}

/// Wait for the event that settles `op`.
async fn settled(rx: &mut broadcast::Receiver<SessionEvent>, op: OperationId) -> SessionEvent {
    wait_for(rx, |e| e.operation_id() == Some(op)).await
}

async fn wait_for(
    rx: &mut broadcast::Receiver<SessionEvent>,
    mut pred: impl FnMut(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(EVENT_WAIT, async {
        loop {
            let event = rx.recv().await.expect("event channel");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

fn names(companies: &[Company]) -> Vec<&str> {
    companies.iter().map(|c| c.name.as_str()).collect()
}

fn id(n: i64) -> CompanyId {
    CompanyId::new(n)
}

// ============================================================================
// Optimistic mutations
// ============================================================================

#[tokio::test]
async fn test_rename_visible_before_confirmation_and_echo_dropped() {
    let server = Arc::new(MemoryServer::with_companies(["Acme", "Globex"]));
    server.set_latency(Duration::from_millis(50));
    let session = live_session(&server, SessionConfig::default()).await;
    let mut rx = session.subscribe();

    let op = session.request_rename(id(1), "Acme Corp").await.unwrap();
    assert_eq!(names(&session.companies().await.unwrap()), ["Acme Corp", "Globex"]);

    let event = settled(&mut rx, op).await;
    assert_eq!(event, SessionEvent::MutationConfirmed { operation_id: op, kind: MutationKind::Rename });
    assert_eq!(names(&session.companies().await.unwrap()), ["Acme Corp", "Globex"]);

    let status = session.status().await.unwrap();
    assert!(status.is_settled());
    assert_eq!(status.pushes_suppressed, 1, "own rename echo should be dropped");
    assert_eq!(status.pushes_applied, 0);
}

#[tokio::test]
async fn test_add_placeholder_replaced_by_server_entity() {
    let server = Arc::new(MemoryServer::with_companies(["Acme", "Globex"]));
    server.set_latency(Duration::from_millis(20));
    let session = live_session(&server, SessionConfig::default()).await;
    let mut rx = session.subscribe();

    let op = session.request_add("Initech").await.unwrap();
    let speculative = session.companies().await.unwrap();
    assert_eq!(names(&speculative), ["Acme", "Globex", "Initech"]);
    assert!(speculative[2].id.is_placeholder());

    settled(&mut rx, op).await;
    let companies = session.companies().await.unwrap();
    assert_eq!(companies, vec![
        Company::new(1, "Acme"),
        Company::new(2, "Globex"),
        Company::new(3, "Initech"),
    ]);
}

#[tokio::test]
async fn test_failed_delete_restores_position() {
    let server = Arc::new(MemoryServer::with_companies(["Acme", "Globex", "Initech"]));
    server.set_latency(Duration::from_millis(10));
    server.fail_next(Fault::Reject("company is locked".into()));
    let session = live_session(&server, SessionConfig::default()).await;
    let mut rx = session.subscribe();

    let op = session.request_delete(id(2)).await.unwrap();
    assert_eq!(names(&session.companies().await.unwrap()), ["Acme", "Initech"]);

    match settled(&mut rx, op).await {
        SessionEvent::MutationFailed { reason: FailureReason::Conflict(_), .. } => {}
        other => panic!("expected conflict failure, got {other:?}"),
    }
    assert_eq!(names(&session.companies().await.unwrap()), ["Acme", "Globex", "Initech"]);
}

#[tokio::test]
async fn test_unreachable_rename_rolls_back() {
    let server = Arc::new(MemoryServer::with_companies(["Acme"]));
    server.fail_next(Fault::Unreachable);
    let session = live_session(&server, SessionConfig::default()).await;
    let mut rx = session.subscribe();

    let op = session.request_rename(id(1), "Acme Corp").await.unwrap();
    match settled(&mut rx, op).await {
        SessionEvent::MutationFailed { reason: FailureReason::Transport(_), .. } => {}
        other => panic!("expected transport failure, got {other:?}"),
    }
    assert_eq!(session.companies().await.unwrap(), vec![Company::new(1, "Acme")]);
}

#[tokio::test]
async fn test_lost_add_response_keeps_echoed_entity() {
    let server = Arc::new(MemoryServer::with_companies(["Acme"]));
    server.set_latency(Duration::from_millis(20));
    server.fail_next(Fault::LostResponse);
    let session = live_session(&server, SessionConfig::default()).await;
    let mut rx = session.subscribe();

    let op = session.request_add("Hooli").await.unwrap();
    assert!(matches!(settled(&mut rx, op).await, SessionEvent::MutationFailed { .. }));

    // The server did create it; the echo told us its id.
    assert_eq!(session.companies().await.unwrap(), server.companies());
    assert_eq!(server.companies(), vec![Company::new(1, "Acme"), Company::new(2, "Hooli")]);
}

#[tokio::test]
async fn test_round_trip_timeout_fails_mutation() {
    let server = Arc::new(MemoryServer::with_companies(["Acme"]));
    server.set_latency(Duration::from_millis(500));
    let config = SessionConfig::default().with_round_trip_timeout(Duration::from_millis(20));
    let session = live_session(&server, config).await;
    let mut rx = session.subscribe();

    let op = session.request_rename(id(1), "Acme Corp").await.unwrap();
    match settled(&mut rx, op).await {
        SessionEvent::MutationFailed { reason: FailureReason::Transport(msg), .. } => {
            assert!(msg.contains("20ms"), "{msg}");
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(names(&session.companies().await.unwrap()), ["Acme"]);

    // The server applied it anyway; a refetch converges.
    session.refresh().await.unwrap();
    assert_eq!(names(&session.companies().await.unwrap()), ["Acme Corp"]);
}

// ============================================================================
// Conflicting mutations
// ============================================================================

#[tokio::test]
async fn test_queued_rename_runs_after_first() {
    let server = Arc::new(MemoryServer::with_companies(["Acme"]));
    server.set_latency(Duration::from_millis(20));
    let session = live_session(&server, SessionConfig::default()).await;
    let mut rx = session.subscribe();

    let first = session.request_rename(id(1), "First").await.unwrap();
    let second = session.request_rename(id(1), "Second").await.unwrap();
    assert_eq!(session.status().await.unwrap().queued_mutations, 1);
    // Queued mutations are not applied until they start.
    assert_eq!(names(&session.companies().await.unwrap()), ["First"]);

    settled(&mut rx, first).await;
    settled(&mut rx, second).await;
    assert_eq!(names(&session.companies().await.unwrap()), ["Second"]);
    assert_eq!(names(&server.companies()), ["Second"]);
    assert!(session.status().await.unwrap().is_settled());
}

#[tokio::test]
async fn test_reject_policy_refuses_second_mutation() {
    let server = Arc::new(MemoryServer::with_companies(["Acme"]));
    server.set_latency(Duration::from_millis(50));
    let config = SessionConfig::default().with_conflict_policy(ConflictPolicy::Reject);
    let session = live_session(&server, config).await;

    session.request_rename(id(1), "First").await.unwrap();
    let err = session.request_delete(id(1)).await.unwrap_err();
    assert_eq!(err, SessionError::Cache(CacheError::TargetBusy(id(1))));
}

#[tokio::test]
async fn test_delete_of_pending_add_follows_server_id() {
    let server = Arc::new(MemoryServer::with_companies(["Acme"]));
    server.set_latency(Duration::from_millis(20));
    let session = live_session(&server, SessionConfig::default()).await;
    let mut rx = session.subscribe();

    let add = session.request_add("Temp").await.unwrap();
    let placeholder = session.companies().await.unwrap()[1].id;
    let delete = session.request_delete(placeholder).await.unwrap();

    settled(&mut rx, add).await;
    let event = settled(&mut rx, delete).await;
    assert_eq!(event, SessionEvent::MutationConfirmed { operation_id: delete, kind: MutationKind::Delete });
    assert_eq!(names(&session.companies().await.unwrap()), ["Acme"]);
    assert_eq!(names(&server.companies()), ["Acme"]);
}

// ============================================================================
// Refused requests
// ============================================================================

#[tokio::test]
async fn test_invalid_requests_are_refused() {
    let server = Arc::new(MemoryServer::with_companies(["Acme"]));
    let session = live_session(&server, SessionConfig::default()).await;

    assert_eq!(
        session.request_add("   ").await.unwrap_err(),
        SessionError::Cache(CacheError::Validation(ValidationError::EmptyName))
    );
    assert_eq!(
        session.request_rename(id(42), "Nope").await.unwrap_err(),
        SessionError::Cache(CacheError::UnknownTarget(id(42)))
    );
    assert_eq!(session.companies().await.unwrap(), server.companies());
}

#[tokio::test]
async fn test_mutation_before_first_fetch_is_not_live() {
    init_tracing();
    let server = Arc::new(MemoryServer::with_companies(["Acme"]));
    let session = spawn_session(server.clone(), SessionConfig::default().with_fetch_on_start(false));

    assert_eq!(session.status().await.unwrap().state, SessionState::Uninitialized);
    assert_eq!(
        session.request_add("Early").await.unwrap_err(),
        SessionError::Cache(CacheError::NotLive)
    );

    assert_eq!(session.refresh().await.unwrap(), 1);
    assert_eq!(session.status().await.unwrap().state, SessionState::Live);
    session.request_add("Later").await.unwrap();
}

// ============================================================================
// Changes from other clients
// ============================================================================

#[tokio::test]
async fn test_external_changes_are_merged() {
    let server = Arc::new(MemoryServer::with_companies(["Acme", "Globex"]));
    let session = live_session(&server, SessionConfig::default()).await;
    let mut rx = session.subscribe();

    server.external_rename(id(2), "Globex Intl").unwrap();
    wait_for(&mut rx, |e| matches!(e, SessionEvent::CollectionChanged { .. })).await;
    server.external_add("Umbrella");
    wait_for(&mut rx, |e| matches!(e, SessionEvent::CollectionChanged { .. })).await;

    assert_eq!(names(&session.companies().await.unwrap()), ["Acme", "Globex Intl", "Umbrella"]);
    assert_eq!(session.status().await.unwrap().pushes_applied, 2);
}

#[tokio::test]
async fn test_external_delete_needs_refresh() {
    let server = Arc::new(MemoryServer::with_companies(["Acme", "Globex"]));
    let session = live_session(&server, SessionConfig::default()).await;

    assert!(server.external_delete(id(1)));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(names(&session.companies().await.unwrap()), ["Acme", "Globex"]);

    assert_eq!(session.refresh().await.unwrap(), 1);
    assert_eq!(names(&session.companies().await.unwrap()), ["Globex"]);
}

#[tokio::test]
async fn test_external_rename_during_own_rename_is_rebased() {
    let server = Arc::new(MemoryServer::with_companies(["Acme"]));
    server.set_latency(Duration::from_millis(30));
    server.fail_next(Fault::Reject("no".into()));
    let session = live_session(&server, SessionConfig::default()).await;
    let mut rx = session.subscribe();

    let op = session.request_rename(id(1), "Mine").await.unwrap();
    server.external_rename(id(1), "Theirs").unwrap();
    settled(&mut rx, op).await;

    // Rollback lands on the value the server pushed, not the stale prior.
    assert_eq!(names(&session.companies().await.unwrap()), ["Theirs"]);
}

#[tokio::test]
async fn test_push_overflow_triggers_refetch() {
    let server = Arc::new(MemoryServer::with_companies(["Acme", "Globex"]));
    let config = SessionConfig { event_capacity: 4096, ..SessionConfig::default() };
    let session = live_session(&server, config).await;
    let mut rx = session.subscribe();

    // No await in between, so the session's push receiver falls behind.
    let burst = PUSH_CHANNEL_CAPACITY + 76;
    for i in 0..burst {
        server.external_rename(id(1), &format!("Acme {i}")).unwrap();
    }
    assert!(server.external_delete(id(2)));

    match wait_for(&mut rx, |e| matches!(e, SessionEvent::PushLagged { .. })).await {
        SessionEvent::PushLagged { missed } => assert_eq!(missed, 76),
        other => panic!("expected lag, got {other:?}"),
    }

    // The refetch brings in the unpushed delete as well as the last rename.
    let expected = server.companies();
    tokio::time::timeout(EVENT_WAIT, async {
        while session.companies().await.unwrap() != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("view did not converge after lag");
    assert_eq!(names(&expected), [format!("Acme {}", burst - 1)]);
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test]
async fn test_close_stops_session() {
    let server = Arc::new(MemoryServer::with_companies(["Acme"]));
    server.set_latency(Duration::from_millis(30));
    let session = live_session(&server, SessionConfig::default()).await;
    let mut rx = session.subscribe();

    session.request_rename(id(1), "Late").await.unwrap();
    session.close().await.unwrap();

    wait_for(&mut rx, |e| *e == SessionEvent::Closed).await;
    assert!(session.is_closed());
    assert_eq!(session.companies().await.unwrap_err(), SessionError::Shutdown);
    assert_eq!(session.request_add("After").await.unwrap_err(), SessionError::Shutdown);

    // The in-flight round trip still completes on the server; nobody listens.
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(names(&server.companies()), ["Late"]);
}
