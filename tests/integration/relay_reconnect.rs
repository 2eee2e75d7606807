// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::needless_continue,
    clippy::match_same_arms,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc
)]

//! Integration tests for push-channel reconnection against the real relay.
//!
//! These tests validate:
//! - `ConnectionManager` over `WebSocketTransport` receives relayed mutations
//! - A server-side close is detected and followed by a backoff reconnect
//! - Sequence numbers keep increasing across reconnects
//! - An unreachable endpoint ends in `Failed` after the configured attempts
//! - A `SyncCoordinator` applies mutations injected at the relay

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tasksync::api::memory::InMemoryTaskApi;
use tasksync::connection::{BackoffPolicy, ConnectionEvent, ConnectionManager, ConnectionState};
use tasksync::coordinator::{SyncCoordinator, SyncOptions};
use tasksync::transport::websocket::WebSocketTransport;
use tasksync_proto::task::{MutationEvent, Priority, Task, TaskId, TaskStatus, Timestamp, User};
use tasksync_relay::relay::{RelayState, start_server_with_state};
use tokio::sync::mpsc;

fn user() -> User {
    User::new("u1", "Alice", "alice@example.com")
}

fn task(id: &str, updated_at: u64) -> Task {
    Task {
        id: TaskId::new(id),
        title: format!("task {id}"),
        description: String::new(),
        status: TaskStatus::Todo,
        priority: Priority::High,
        assigned_to: None,
        created_by: user(),
        created_at: Timestamp::from_millis(1_000),
        updated_at: Timestamp::from_millis(updated_at),
        due_date: None,
        tags: BTreeSet::new(),
    }
}

fn fast_policy(max_attempts: u32) -> BackoffPolicy {
    BackoffPolicy::new(Duration::from_millis(50), Duration::from_millis(400), max_attempts)
}

async fn start_relay() -> (Arc<RelayState>, String) {
    let state = Arc::new(RelayState::new());
    let (addr, _handle) = start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("relay should start");
    (state, format!("ws://{addr}/ws"))
}

/// Forwards every connection event into a channel the test can await.
fn events(
    manager: &ConnectionManager<WebSocketTransport>,
) -> mpsc::UnboundedReceiver<ConnectionEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    manager.subscribe(move |event| {
        let _ = tx.send(event.clone());
    });
    rx
}

async fn next_matching(
    rx: &mut mpsc::UnboundedReceiver<ConnectionEvent>,
    mut want: impl FnMut(&ConnectionEvent) -> bool,
) -> ConnectionEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for connection event")
            .expect("event stream ended");
        if want(&event) {
            return event;
        }
    }
}

fn is_state(want: ConnectionState) -> impl FnMut(&ConnectionEvent) -> bool {
    move |event| matches!(event, ConnectionEvent::State(s) if *s == want)
}

async fn wait_for_clients(state: &RelayState, n: usize) {
    for _ in 0..400 {
        if state.client_count().await == n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("relay never had exactly {n} clients");
}

#[tokio::test]
async fn receives_mutations_published_at_relay() {
    let (relay, url) = start_relay().await;
    let manager = ConnectionManager::new(WebSocketTransport::new(url), fast_policy(5));
    let mut rx = events(&manager);

    manager.connect();
    next_matching(&mut rx, is_state(ConnectionState::Connected)).await;
    wait_for_clients(&relay, 1).await;

    relay.publish(&MutationEvent::Created(task("t1", 2_000))).unwrap();

    let event = next_matching(&mut rx, |e| matches!(e, ConnectionEvent::Mutation(_))).await;
    let ConnectionEvent::Mutation(sequenced) = event else {
        unreachable!();
    };
    assert_eq!(sequenced.seq, 1);
    assert_eq!(sequenced.event, MutationEvent::Created(task("t1", 2_000)));

    manager.disconnect().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn reconnects_after_server_close() {
    let (relay, url) = start_relay().await;
    let manager = ConnectionManager::new(WebSocketTransport::new(url), fast_policy(5));
    let mut rx = events(&manager);

    manager.connect();
    next_matching(&mut rx, is_state(ConnectionState::Connected)).await;
    wait_for_clients(&relay, 1).await;
    relay.publish(&MutationEvent::Created(task("t1", 2_000))).unwrap();
    next_matching(&mut rx, |e| matches!(e, ConnectionEvent::Mutation(_))).await;

    relay.close_all_connections().await;

    let scheduled = next_matching(&mut rx, |e| {
        matches!(e, ConnectionEvent::ReconnectScheduled { .. })
    })
    .await;
    assert!(matches!(
        scheduled,
        ConnectionEvent::ReconnectScheduled {
            attempt: 1,
            delay
        } if delay == Duration::from_millis(100)
    ));
    // The old socket must be gone before the new one counts.
    wait_for_clients(&relay, 0).await;
    next_matching(&mut rx, is_state(ConnectionState::Connected)).await;
    wait_for_clients(&relay, 1).await;

    relay.publish(&MutationEvent::Deleted(TaskId::new("t1"))).unwrap();
    let event = next_matching(&mut rx, |e| matches!(e, ConnectionEvent::Mutation(_))).await;
    let ConnectionEvent::Mutation(sequenced) = event else {
        unreachable!();
    };
    assert_eq!(sequenced.seq, 2, "sequence continues across reconnects");
    assert_eq!(manager.last_sequence(), 2);

    manager.disconnect().await;
}

#[tokio::test]
async fn unreachable_relay_ends_in_failed() {
    // Bind then drop to get a port with no listener.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let transport = WebSocketTransport::new(format!("ws://{addr}/ws"))
        .with_connect_timeout(Duration::from_secs(2));
    let manager = ConnectionManager::new(transport, fast_policy(2));
    let mut rx = events(&manager);

    let started = Instant::now();
    manager.connect();

    let mut delays = Vec::new();
    loop {
        match next_matching(&mut rx, |_| true).await {
            ConnectionEvent::ReconnectScheduled { delay, .. } => delays.push(delay),
            ConnectionEvent::State(ConnectionState::Failed) => break,
            _ => {}
        }
    }

    assert_eq!(delays, vec![Duration::from_millis(100), Duration::from_millis(200)]);
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(manager.state(), ConnectionState::Failed);
}

#[tokio::test]
async fn coordinator_applies_relayed_mutations() {
    let (relay, url) = start_relay().await;
    let api = InMemoryTaskApi::new(user());
    api.seed(vec![task("t1", 2_000)]);
    let options = SyncOptions {
        reconnect: fast_policy(5),
        ..SyncOptions::default()
    };
    let coordinator = SyncCoordinator::new(api, WebSocketTransport::new(url), user(), options);

    coordinator.start();
    wait_for_clients(&relay, 1).await;

    relay.publish(&MutationEvent::Created(task("t2", 3_000))).unwrap();
    relay.publish(&MutationEvent::Updated(task("t1", 1_500))).unwrap();

    for _ in 0..400 {
        if coordinator.tasks().len() == 2 && !coordinator.state().snapshot_requested() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let tasks = coordinator.tasks();
    assert!(tasks.contains(&TaskId::new("t2")));
    assert_eq!(
        tasks.get(&TaskId::new("t1")).map(|t| t.updated_at),
        Some(Timestamp::from_millis(2_000)),
        "older relayed update must not clobber the snapshot record"
    );

    coordinator.stop().await;
    assert_eq!(coordinator.connection_state(), ConnectionState::Disconnected);
}
