//! Sync coordinator.
//!
//! Owns the reconciled [`SyncState`], one [`ConnectionManager`], and the
//! [`TaskApi`] collaborator. On [`start`](SyncCoordinator::start) it marks a
//! snapshot request, connects the push channel, and fetches the snapshot in
//! the background. Push mutations, the snapshot, and local writes all flow
//! through [`reconcile`]; every step that changes the collection is announced
//! to consumers as [`SyncEvent::CollectionChanged`].
//!
//! # Architecture
//!
//! ```text
//! ConnectionManager ── ConnectionEvent ──▶ coordinator ── reconcile() ──▶ SyncState
//! TaskApi (snapshot, confirmations) ─────▶     │
//!                                              └── SyncEvent ──▶ consumers
//! ```
//!
//! Merges are serialized: computing the next state and publishing its
//! notification happen under one lock, so two merges never interleave within
//! a fan-out. A consumer handler that calls back into a merge operation gets
//! [`SyncError::Reentrant`] instead of deadlocking; use
//! [`event_channel`](SyncCoordinator::event_channel) to react asynchronously.

use std::cell::Cell;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use tasksync_proto::task::{MutationEvent, Task, TaskDraft, TaskId, TaskPatch, Timestamp, User};

use crate::api::{ApiError, TaskApi};
use crate::bus::{EventBus, SubscriptionToken};
use crate::clock::{Clock, SystemClock};
use crate::connection::{BackoffPolicy, ConnectionEvent, ConnectionManager, ConnectionState, Sequenced};
use crate::tasks::{ChangeSet, Input, SyncState, TaskCollection, reconcile};
use crate::transport::Transport;

/// Errors from coordinator operations.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The backend request failed; any optimistic change was rolled back.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The task is not in the local collection.
    #[error("task not found locally: {0}")]
    NotFound(TaskId),

    /// A merge was requested from inside a change handler.
    #[error("merge requested from inside a sync event handler")]
    Reentrant,
}

/// What caused a collection change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A snapshot fetch completed.
    Snapshot,
    /// A push-channel mutation with its arrival sequence number.
    Push {
        /// Arrival sequence number.
        seq: u64,
    },
    /// A local optimistic write.
    Local,
    /// A server record returned by a request.
    Confirmed,
    /// A failed request's optimistic write was undone.
    Rollback,
}

/// Notifications published to consumers.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// The collection changed (a snapshot always publishes, even if equal).
    CollectionChanged {
        /// The collection after the change.
        tasks: TaskCollection,
        /// Ids affected.
        changes: ChangeSet,
        /// What caused it.
        origin: Origin,
    },
    /// The push channel changed state.
    ConnectionChanged(ConnectionState),
    /// The push channel will retry after `delay`.
    ReconnectScheduled {
        /// 1-based retry number.
        attempt: u32,
        /// Retry limit.
        max_attempts: u32,
        /// Delay before the retry.
        delay: Duration,
    },
    /// A snapshot fetch failed; the previous collection is kept.
    SnapshotFailed {
        /// 1-based attempt number.
        attempt: u32,
        /// The failure.
        error: ApiError,
    },
}

/// Tuning for a [`SyncCoordinator`].
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Push-channel reconnect schedule.
    pub reconnect: BackoffPolicy,
    /// Snapshot fetch retry schedule.
    pub snapshot_retry: BackoffPolicy,
    /// Fetch a fresh snapshot after the push channel recovers from a drop.
    pub resync_on_reconnect: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            reconnect: BackoffPolicy::default(),
            snapshot_retry: BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(10), 5),
            resync_on_reconnect: true,
        }
    }
}

/// Result of one merge: what changed and the state it produced.
struct Merged {
    changes: ChangeSet,
    state: Arc<SyncState>,
}

/// State shared with the connection handler and the snapshot task.
struct Shared<A, C> {
    api: A,
    clock: C,
    user: User,
    options: SyncOptions,
    state: RwLock<Arc<SyncState>>,
    /// Serializes merges and publishes; the flag marks an active fan-out.
    dispatch: ReentrantMutex<Cell<bool>>,
    bus: EventBus<SyncEvent>,
    snapshot_task: Mutex<Option<JoinHandle<()>>>,
    /// Set once the push channel has been connected at least once.
    was_connected: Mutex<bool>,
}

/// Keeps a task collection in sync with the backend.
pub struct SyncCoordinator<A: TaskApi, T: Transport, C: Clock = SystemClock> {
    shared: Arc<Shared<A, C>>,
    connection: ConnectionManager<T>,
    subscription: Mutex<Option<SubscriptionToken>>,
}

impl<A: TaskApi, T: Transport> SyncCoordinator<A, T, SystemClock> {
    /// Creates a stopped coordinator acting as `user`.
    #[must_use]
    pub fn new(api: A, transport: T, user: User, options: SyncOptions) -> Self {
        Self::with_clock(api, transport, user, options, SystemClock)
    }
}

impl<A: TaskApi, T: Transport, C: Clock> SyncCoordinator<A, T, C> {
    /// Creates a stopped coordinator that stamps local writes with `clock`.
    pub fn with_clock(api: A, transport: T, user: User, options: SyncOptions, clock: C) -> Self {
        let connection = ConnectionManager::new(transport, options.reconnect);
        Self {
            shared: Arc::new(Shared {
                api,
                clock,
                user,
                options,
                state: RwLock::new(Arc::new(SyncState::new())),
                dispatch: ReentrantMutex::new(Cell::new(false)),
                bus: EventBus::new(),
                snapshot_task: Mutex::new(None),
                was_connected: Mutex::new(false),
            }),
            connection,
            subscription: Mutex::new(None),
        }
    }

    /// Subscribes to the push channel, connects it, and starts the snapshot
    /// fetch. Must be called inside a Tokio runtime. Calling it while
    /// running does nothing.
    pub fn start(&self) {
        let mut subscription = self.subscription.lock();
        if subscription.is_some() {
            tracing::debug!("sync coordinator already running");
            return;
        }

        let weak: Weak<Shared<A, C>> = Arc::downgrade(&self.shared);
        let token = self.connection.subscribe(move |event| {
            if let Some(shared) = weak.upgrade() {
                shared.on_connection_event(event);
            }
        });
        *subscription = Some(token);
        drop(subscription);
        *self.shared.was_connected.lock() = false;

        // Mark the request before connecting so early pushes are tracked.
        Shared::request_snapshot(&self.shared);
        self.connection.connect();
        tracing::info!(endpoint = %self.connection.transport().endpoint(), "sync started");
    }

    /// Stops syncing. Idempotent.
    ///
    /// Unsubscribes from and disconnects the push channel, cancels an
    /// in-flight snapshot fetch, and releases every consumer handler. The
    /// collection is kept; a later [`start`](Self::start) resumes from it.
    pub async fn stop(&self) {
        if let Some(token) = self.subscription.lock().take() {
            self.connection.unsubscribe(token);
        }
        self.connection.disconnect().await;

        let snapshot = self.shared.snapshot_task.lock().take();
        if let Some(handle) = snapshot {
            handle.abort();
            if let Err(e) = handle.await
                && e.is_panic()
            {
                tracing::error!(error = %e, "snapshot task panicked");
            }
        }

        let released = self.shared.bus.clear();
        tracing::info!(released, "sync stopped");
    }

    /// Whether [`start`](Self::start) has been called without a matching stop.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.subscription.lock().is_some()
    }

    /// Applies a local optimistic mutation stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Reentrant`] if called from a sync event handler.
    pub fn apply_local_mutation(&self, event: &MutationEvent) -> Result<ChangeSet, SyncError> {
        let now = self.shared.clock.now();
        self.shared
            .merge(Input::Local { event, now }, Origin::Local)
            .map(|m| m.changes)
    }

    /// Applies a server-returned record exactly like a push event.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Reentrant`] if called from a sync event handler.
    pub fn apply_confirmed(&self, event: &MutationEvent) -> Result<ChangeSet, SyncError> {
        self.shared
            .merge(Input::Remote(event), Origin::Confirmed)
            .map(|m| m.changes)
    }

    /// The current collection.
    #[must_use]
    pub fn tasks(&self) -> TaskCollection {
        self.shared.state.read().tasks().clone()
    }

    /// The full reconciler state, including pending writes.
    #[must_use]
    pub fn state(&self) -> Arc<SyncState> {
        Arc::clone(&self.shared.state.read())
    }

    /// The push channel's state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Registers a consumer handler.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionToken
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.shared.bus.subscribe(handler)
    }

    /// Removes a consumer handler.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.shared.bus.unsubscribe(token)
    }

    /// Forwards every event into a bounded channel.
    ///
    /// Events that do not fit are dropped with a warning. The forwarding
    /// handler removes itself once the receiver is dropped.
    pub fn event_channel(&self, capacity: usize) -> mpsc::Receiver<SyncEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let own_token: Arc<OnceLock<SubscriptionToken>> = Arc::new(OnceLock::new());
        let handler_token = Arc::clone(&own_token);
        let weak = Arc::downgrade(&self.shared);
        let token = self.shared.bus.subscribe(move |event: &SyncEvent| {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!("sync event channel full, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    if let (Some(shared), Some(token)) = (weak.upgrade(), handler_token.get()) {
                        shared.bus.unsubscribe(*token);
                    }
                }
            }
        });
        let _ = own_token.set(token);
        rx
    }

    /// Creates a task: shows it immediately under a provisional id, then
    /// swaps in the server record or removes it if the request fails.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Api`] if the request fails.
    pub async fn create_task(&self, draft: TaskDraft) -> Result<Task, SyncError> {
        let provisional = TaskId::provisional();
        let now = self.shared.clock.now();
        let optimistic = draft
            .clone()
            .into_task(provisional.clone(), self.shared.user.clone(), now);
        let merged = self.shared.merge(
            Input::Local {
                event: &MutationEvent::Created(optimistic),
                now,
            },
            Origin::Local,
        )?;
        let at = merged.state.pending(&provisional).map(|p| p.at);

        match self.shared.api.create_task(draft).await {
            Ok(task) => {
                self.shared.merge(
                    Input::ConfirmCreate {
                        provisional: &provisional,
                        confirmed: &task,
                    },
                    Origin::Confirmed,
                )?;
                Ok(task)
            }
            Err(e) => {
                tracing::warn!(task_id = %provisional, error = %e, "create failed, rolling back");
                self.rollback(&provisional, at)?;
                Err(e.into())
            }
        }
    }

    /// Applies `patch` optimistically, then confirms or rolls back.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NotFound`] if the task is not held locally and
    /// [`SyncError::Api`] if the request fails.
    pub async fn update_task(&self, id: &TaskId, patch: TaskPatch) -> Result<Task, SyncError> {
        let current = self
            .tasks()
            .get(id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(id.clone()))?;
        let now = self.shared.clock.now();
        let optimistic = patch.apply(&current, now);
        let merged = self.shared.merge(
            Input::Local {
                event: &MutationEvent::Updated(optimistic),
                now,
            },
            Origin::Local,
        )?;
        let at = merged.state.pending(id).map(|p| p.at);

        match self.shared.api.update_task(id, patch).await {
            Ok(task) => {
                self.shared.merge(
                    Input::Remote(&MutationEvent::Updated(task.clone())),
                    Origin::Confirmed,
                )?;
                Ok(task)
            }
            Err(e) => {
                tracing::warn!(task_id = %id, error = %e, "update failed, rolling back");
                self.rollback(id, at)?;
                Err(e.into())
            }
        }
    }

    /// Removes the task optimistically, then confirms or restores it.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Api`] if the request fails.
    pub async fn delete_task(&self, id: &TaskId) -> Result<(), SyncError> {
        let merged = self.shared.merge(
            Input::Local {
                event: &MutationEvent::Deleted(id.clone()),
                now: self.shared.clock.now(),
            },
            Origin::Local,
        )?;
        let at = merged.state.pending(id).map(|p| p.at);

        match self.shared.api.delete_task(id).await {
            Ok(()) => {
                self.shared
                    .merge(Input::Remote(&MutationEvent::Deleted(id.clone())), Origin::Confirmed)?;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(task_id = %id, error = %e, "delete failed, rolling back");
                self.rollback(id, at)?;
                Err(e.into())
            }
        }
    }

    /// Advances the task's status one step (`todo -> in-progress -> completed -> todo`).
    ///
    /// # Errors
    ///
    /// Same as [`update_task`](Self::update_task).
    pub async fn cycle_status(&self, id: &TaskId) -> Result<Task, SyncError> {
        let status = self
            .tasks()
            .get(id)
            .map(|t| t.status.next())
            .ok_or_else(|| SyncError::NotFound(id.clone()))?;
        self.update_task(id, TaskPatch::status(status)).await
    }

    /// Requests a fresh snapshot unless one is already in flight.
    pub fn refresh(&self) {
        Shared::request_snapshot(&self.shared);
    }

    /// The backend collaborator.
    #[must_use]
    pub fn api(&self) -> &A {
        &self.shared.api
    }

    /// The push connection manager.
    #[must_use]
    pub const fn connection(&self) -> &ConnectionManager<T> {
        &self.connection
    }

    fn rollback(&self, id: &TaskId, at: Option<Timestamp>) -> Result<(), SyncError> {
        if let Some(at) = at {
            self.shared.merge(Input::Rollback { id, at }, Origin::Rollback)?;
        }
        Ok(())
    }
}

impl<A: TaskApi, T: Transport, C: Clock> Drop for SyncCoordinator<A, T, C> {
    fn drop(&mut self) {
        if let Some(handle) = self.shared.snapshot_task.lock().take() {
            handle.abort();
        }
        self.shared.bus.close();
    }
}

impl<A: TaskApi, C: Clock> Shared<A, C> {
    fn merge(&self, input: Input<'_>, origin: Origin) -> Result<Merged, SyncError> {
        let guard = self.dispatch.lock();
        if guard.get() {
            return Err(SyncError::Reentrant);
        }

        let is_snapshot = matches!(input, Input::Snapshot(_));
        let current = Arc::clone(&self.state.read());
        let out = reconcile(&current, input);
        let state = Arc::new(out.state);
        *self.state.write() = Arc::clone(&state);

        if !out.changes.is_empty() || is_snapshot {
            tracing::debug!(
                ?origin,
                inserted = out.changes.inserted.len(),
                updated = out.changes.updated.len(),
                removed = out.changes.removed.len(),
                "collection changed"
            );
            guard.set(true);
            self.bus.publish(&SyncEvent::CollectionChanged {
                tasks: state.tasks().clone(),
                changes: out.changes.clone(),
                origin,
            });
            guard.set(false);
        }
        Ok(Merged {
            changes: out.changes,
            state,
        })
    }

    fn publish(&self, event: &SyncEvent) {
        let guard = self.dispatch.lock();
        let outer = guard.replace(true);
        self.bus.publish(event);
        guard.set(outer);
    }

    fn on_connection_event(self: &Arc<Self>, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::State(state) => {
                self.publish(&SyncEvent::ConnectionChanged(*state));
                if *state == ConnectionState::Connected {
                    let reconnected = std::mem::replace(&mut *self.was_connected.lock(), true);
                    if reconnected && self.options.resync_on_reconnect {
                        tracing::info!("push channel recovered, refreshing snapshot");
                        Self::request_snapshot(self);
                    }
                }
            }
            ConnectionEvent::ReconnectScheduled { attempt, delay } => {
                self.publish(&SyncEvent::ReconnectScheduled {
                    attempt: *attempt,
                    max_attempts: self.options.reconnect.max_attempts,
                    delay: *delay,
                });
            }
            ConnectionEvent::Mutation(Sequenced { seq, event }) => {
                if let Err(e) = self.merge(Input::Remote(event), Origin::Push { seq: *seq }) {
                    tracing::error!(seq, error = %e, "push mutation not applied");
                }
            }
        }
    }

    /// Marks a snapshot request and spawns the fetch, unless one is running.
    fn request_snapshot(self: &Arc<Self>) {
        if self.snapshot_in_flight() {
            tracing::debug!("snapshot already in flight");
            return;
        }
        if let Err(e) = self.merge(Input::BeginSnapshot, Origin::Snapshot) {
            tracing::error!(error = %e, "could not mark snapshot request");
            return;
        }
        let handle = tokio::spawn(fetch_snapshot(Arc::clone(self)));
        if let Some(stale) = self.snapshot_task.lock().replace(handle) {
            stale.abort();
        }
    }

    fn snapshot_in_flight(&self) -> bool {
        self.snapshot_task
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

/// Fetches the snapshot, retrying transient failures, and merges it.
async fn fetch_snapshot<A: TaskApi, C: Clock>(shared: Arc<Shared<A, C>>) {
    let policy = shared.options.snapshot_retry;
    let mut attempt: u32 = 0;
    loop {
        match shared.api.fetch_all_tasks().await {
            Ok(tasks) => {
                let (valid, invalid): (Vec<Task>, Vec<Task>) =
                    tasks.into_iter().partition(|t| t.validate().is_ok());
                if !invalid.is_empty() {
                    tracing::warn!(skipped = invalid.len(), "snapshot contained invalid tasks");
                }
                match shared.merge(Input::Snapshot(&valid), Origin::Snapshot) {
                    Ok(merged) => tracing::info!(
                        tasks = merged.state.tasks().len(),
                        changed = merged.changes.len(),
                        "snapshot applied"
                    ),
                    Err(e) => tracing::error!(error = %e, "snapshot not applied"),
                }
                return;
            }
            Err(error) => {
                attempt += 1;
                tracing::warn!(attempt, error = %error, "snapshot fetch failed");
                shared.publish(&SyncEvent::SnapshotFailed {
                    attempt,
                    error: error.clone(),
                });
                if !error.is_transient() || !policy.allows_retry(attempt) {
                    tracing::error!(attempt, "giving up on snapshot fetch");
                    return;
                }
                tokio::time::sleep(policy.delay_for(attempt)).await;
            }
        }
    }
}
