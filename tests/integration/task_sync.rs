//! Integration tests for task synchronization between clients.
//!
//! Two coordinators share one in-memory backend. Every write the backend
//! accepts is pushed to both clients over their loopback push channels, the
//! way the real backend's WebSocket feed would.

#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::similar_names,
    clippy::redundant_clone,
    clippy::missing_panics_doc
)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tasksync::api::memory::InMemoryTaskApi;
use tasksync::clock::ManualClock;
use tasksync::connection::{BackoffPolicy, ConnectionState};
use tasksync::coordinator::{Origin, SyncCoordinator, SyncEvent, SyncOptions};
use tasksync::tasks::{ChangeSet, SortKey};
use tasksync::transport::loopback::{LoopbackHandle, LoopbackTransport};
use tasksync_proto::task::{
    MutationEvent, Priority, Task, TaskDraft, TaskId, TaskPatch, TaskStatus, Timestamp, User,
};

type Backend = Arc<InMemoryTaskApi<ManualClock>>;
type Client = SyncCoordinator<Backend, LoopbackTransport, ManualClock>;

fn alice() -> User {
    User::new("u1", "Alice", "alice@example.com")
}

fn bob() -> User {
    User::new("u2", "Bob", "bob@example.com")
}

fn task(id: &str, title: &str, updated_at: u64) -> Task {
    Task {
        id: TaskId::new(id),
        title: title.to_string(),
        description: String::new(),
        status: TaskStatus::Todo,
        priority: Priority::Medium,
        assigned_to: None,
        created_by: alice(),
        created_at: Timestamp::from_millis(1_000),
        updated_at: Timestamp::from_millis(updated_at),
        due_date: None,
        tags: BTreeSet::new(),
    }
}

fn options() -> SyncOptions {
    SyncOptions {
        reconnect: BackoffPolicy::new(Duration::from_millis(1_000), Duration::from_millis(30_000), 5),
        snapshot_retry: BackoffPolicy::new(Duration::from_millis(500), Duration::from_millis(5_000), 3),
        resync_on_reconnect: true,
    }
}

/// Shared backend plus a clock everyone stamps with.
struct World {
    backend: Backend,
    clock: ManualClock,
}

impl World {
    fn new(seed: Vec<Task>) -> Self {
        let clock = ManualClock::new(Timestamp::from_millis(10_000));
        let backend = Arc::new(InMemoryTaskApi::with_clock(alice(), clock.clone()));
        backend.seed(seed);
        Self { backend, clock }
    }

    /// A client whose push channel receives every backend write.
    fn client(&self, user: User) -> (Client, LoopbackHandle) {
        let (transport, handle) = LoopbackTransport::new();
        let feed = handle.clone();
        self.backend.mutations().subscribe(move |event| {
            feed.push_event(event);
        });
        let client = SyncCoordinator::with_clock(
            Arc::clone(&self.backend),
            transport,
            user,
            options(),
            self.clock.clone(),
        );
        (client, handle)
    }
}

/// Polls `check` on the paused clock until it holds.
async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {what}");
}

async fn ready(client: &Client) {
    eventually("client ready", || {
        client.connection_state() == ConnectionState::Connected
            && !client.state().snapshot_requested()
    })
    .await;
}

fn title_of(client: &Client, id: &str) -> Option<String> {
    client.tasks().get(&TaskId::new(id)).map(|t| t.title.clone())
}

#[tokio::test(start_paused = true)]
async fn create_on_one_client_appears_on_the_other() {
    let world = World::new(Vec::new());
    let (a, _ha) = world.client(alice());
    let (b, _hb) = world.client(bob());
    a.start();
    b.start();
    ready(&a).await;
    ready(&b).await;

    let created = a.create_task(TaskDraft::titled("write release notes")).await.unwrap();

    eventually("bob sees the new task", || b.tasks().contains(&created.id)).await;
    assert_eq!(a.tasks().len(), 1);
    assert!(a.tasks().iter().all(|t| !t.id.is_provisional()));
    assert_eq!(b.tasks().get(&created.id), Some(&created));
}

#[tokio::test(start_paused = true)]
async fn updates_and_deletes_propagate_both_ways() {
    let world = World::new(vec![task("t1", "draft", 9_000), task("t2", "review", 9_000)]);
    let (a, _ha) = world.client(alice());
    let (b, _hb) = world.client(bob());
    a.start();
    b.start();
    ready(&a).await;
    ready(&b).await;

    world.clock.advance(100);
    a.update_task(
        &TaskId::new("t1"),
        TaskPatch {
            title: Some("final".to_string()),
            ..TaskPatch::default()
        },
    )
    .await
    .unwrap();
    eventually("bob sees the rename", || title_of(&b, "t1").as_deref() == Some("final")).await;

    world.clock.advance(100);
    b.delete_task(&TaskId::new("t2")).await.unwrap();
    eventually("alice sees the delete", || !a.tasks().contains(&TaskId::new("t2"))).await;

    assert_eq!(a.tasks(), b.tasks());
    assert_eq!(a.state().pending_count(), 0);
    assert_eq!(b.state().pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn stale_push_does_not_clobber_newer_state() {
    let world = World::new(vec![task("t1", "current", 9_000)]);
    let (a, ha) = world.client(alice());
    a.start();
    ready(&a).await;

    ha.push_event(&MutationEvent::Updated(task("t1", "old", 8_000)));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(title_of(&a, "t1").as_deref(), Some("current"));
    assert!(a.connection().last_sequence() >= 1);
}

#[tokio::test(start_paused = true)]
async fn snapshot_keeps_newer_push_and_adds_missing_tasks() {
    let world = World::new(vec![task("t1", "A", 1_000), task("t2", "B", 1_000)]);
    world.backend.set_latency(Duration::from_millis(500));
    let (a, ha) = world.client(alice());

    let mut events = a.event_channel(64);
    a.start();
    eventually("push channel up", || a.connection_state() == ConnectionState::Connected).await;
    // The snapshot is still in flight; a newer record arrives first.
    assert!(a.state().snapshot_requested());
    ha.push_event(&MutationEvent::Updated(task("t1", "A2", 2_000)));

    eventually("snapshot applied", || !a.state().snapshot_requested()).await;
    assert_eq!(title_of(&a, "t1").as_deref(), Some("A2"));
    assert_eq!(title_of(&a, "t2").as_deref(), Some("B"));

    let mut saw_snapshot = false;
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::CollectionChanged {
            origin: Origin::Snapshot,
            changes,
            ..
        } = event
        {
            assert_eq!(changes.inserted, vec![TaskId::new("t2")]);
            saw_snapshot = true;
        }
    }
    assert!(saw_snapshot);
}

#[tokio::test(start_paused = true)]
async fn delete_of_unknown_task_is_a_quiet_noop() {
    let world = World::new(vec![task("t1", "keep", 9_000)]);
    let (a, _ha) = world.client(alice());
    a.start();
    ready(&a).await;
    let before = a.tasks();

    let changes = a
        .apply_confirmed(&MutationEvent::Deleted(TaskId::new("t99")))
        .unwrap();

    assert_eq!(changes, ChangeSet::default());
    assert!(a.tasks().ptr_eq(&before));
}

#[tokio::test(start_paused = true)]
async fn rejected_write_rolls_back_on_every_view() {
    let world = World::new(vec![task("t1", "short", 9_000)]);
    let (a, _ha) = world.client(alice());
    let (b, _hb) = world.client(bob());
    a.start();
    b.start();
    ready(&a).await;
    ready(&b).await;

    world.clock.advance(100);
    let too_long = "x".repeat(300);
    let err = a
        .update_task(
            &TaskId::new("t1"),
            TaskPatch {
                title: Some(too_long),
                ..TaskPatch::default()
            },
        )
        .await
        .unwrap_err();

    assert!(err.to_string().contains("rejected"));
    assert_eq!(title_of(&a, "t1").as_deref(), Some("short"));
    assert_eq!(title_of(&b, "t1").as_deref(), Some("short"));
    assert_eq!(a.state().pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn dropped_push_channel_recovers_and_resyncs() {
    let world = World::new(vec![task("t1", "one", 9_000)]);
    let (a, mut ha) = world.client(alice());
    a.start();
    ready(&a).await;

    // A write the client never hears about while its channel is down.
    ha.refuse_next(1);
    ha.drop_connection();
    world.backend.seed(vec![task("t1", "one", 9_000), task("t2", "missed", 9_500)]);

    ha.wait_for_opens(3).await;
    eventually("resynced", || a.tasks().contains(&TaskId::new("t2"))).await;
    assert_eq!(a.connection_state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn sorted_views_reflect_synced_collection() {
    let world = World::new(vec![
        task("t1", "banana", 9_000),
        task("t2", "apple", 9_100),
        task("t3", "cherry", 9_200),
    ]);
    let (a, _ha) = world.client(alice());
    a.start();
    ready(&a).await;

    let tasks = a.tasks();
    let titles: Vec<&str> = tasks
        .sorted_by(SortKey::Title)
        .into_iter()
        .map(|t| t.title.as_str())
        .collect();
    assert_eq!(titles, vec!["apple", "banana", "cherry"]);

    a.stop().await;
    assert_eq!(a.connection_state(), ConnectionState::Disconnected);
    assert_eq!(a.tasks().len(), 3);
}
