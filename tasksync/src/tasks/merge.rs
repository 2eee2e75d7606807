//! Pure last-write-wins reconciliation.
//!
//! [`reconcile`] maps the current [`SyncState`] and one [`Input`] to the next
//! state plus the [`ChangeSet`] it produced. It performs no I/O, never reads
//! the clock (local inputs carry their own `now`), and never mutates its
//! argument.
//!
//! Rules:
//!
//! - An incoming record replaces the held one only if its `updated_at` is
//!   strictly greater. Equal or older records are dropped silently, unless
//!   the held entry is a pending local write with that exact stamp.
//! - `Created` for a known id behaves like `Updated`; `Updated` for an
//!   unknown id behaves like `Created`.
//! - `Deleted` removes the id if present and is a no-op otherwise.
//! - Local writes are stamped with `now`, clamped to be no earlier than
//!   `created_at` and strictly later than the held entry, and stay pending
//!   until a server record at least as new, or a server delete, supersedes
//!   them.
//! - A snapshot replaces the collection except where the held entry is
//!   strictly newer, where a local write is still pending, or where a push
//!   event has touched the id since the snapshot was requested.

use std::collections::HashMap;

use tasksync_proto::task::{MutationEvent, Task, TaskId, Timestamp};

use super::collection::TaskCollection;

/// What a pending local mutation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    /// Created or updated the entry.
    Upsert,
    /// Removed the entry.
    Delete,
}

/// A local optimistic mutation that the server has not yet superseded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMutation {
    /// Stamp assigned when the mutation was applied.
    pub at: Timestamp,
    /// Upsert or delete.
    pub kind: PendingKind,
    /// The entry before the mutation, restored on rollback.
    pub prior: Option<Task>,
}

/// A push event observed while a snapshot request is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Touch {
    Upserted,
    /// Carries the `updated_at` of the entry that was removed, if any.
    Deleted(Option<Timestamp>),
}

/// Everything the reconciler needs to remember between inputs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncState {
    tasks: TaskCollection,
    pending: HashMap<TaskId, PendingMutation>,
    touched: HashMap<TaskId, Touch>,
    snapshot_requested: bool,
}

impl SyncState {
    /// An empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The current collection.
    #[must_use]
    pub const fn tasks(&self) -> &TaskCollection {
        &self.tasks
    }

    /// The pending local mutation for `id`, if any.
    #[must_use]
    pub fn pending(&self, id: &TaskId) -> Option<&PendingMutation> {
        self.pending.get(id)
    }

    /// Number of pending local mutations.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether a snapshot has been requested and not yet applied.
    #[must_use]
    pub const fn snapshot_requested(&self) -> bool {
        self.snapshot_requested
    }
}

/// One reconciler input.
#[derive(Debug, Clone, Copy)]
pub enum Input<'a> {
    /// A snapshot request is starting; push events from now on are tracked.
    BeginSnapshot,
    /// The snapshot result.
    Snapshot(&'a [Task]),
    /// A server-origin mutation (push event or request confirmation).
    Remote(&'a MutationEvent),
    /// A local optimistic mutation applied at `now`.
    Local {
        /// The mutation.
        event: &'a MutationEvent,
        /// Wall-clock time of application.
        now: Timestamp,
    },
    /// The server accepted a create issued under a provisional id.
    ConfirmCreate {
        /// Locally minted id.
        provisional: &'a TaskId,
        /// Record returned by the server.
        confirmed: &'a Task,
    },
    /// The request behind the pending mutation stamped `at` failed.
    Rollback {
        /// Affected task.
        id: &'a TaskId,
        /// Stamp of the failed mutation.
        at: Timestamp,
    },
}

/// Ids affected by one reconcile step, each list sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Newly present ids.
    pub inserted: Vec<TaskId>,
    /// Ids whose record changed.
    pub updated: Vec<TaskId>,
    /// Ids no longer present.
    pub removed: Vec<TaskId>,
}

impl ChangeSet {
    /// Whether nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Total number of affected ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.removed.len()
    }

    fn record(&mut self, id: &TaskId, before: Option<&Task>, after: Option<&Task>) {
        match (before, after) {
            (None, Some(_)) => self.inserted.push(id.clone()),
            (Some(_), None) => self.removed.push(id.clone()),
            (Some(a), Some(b)) if a != b => self.updated.push(id.clone()),
            _ => {}
        }
    }

    fn sort(&mut self) {
        self.inserted.sort();
        self.updated.sort();
        self.removed.sort();
    }
}

/// Result of one reconcile step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    /// The next state.
    pub state: SyncState,
    /// What changed relative to the input state.
    pub changes: ChangeSet,
}

/// Applies one input to `state`.
#[must_use]
pub fn reconcile(state: &SyncState, input: Input<'_>) -> Reconciled {
    let mut next = state.clone();
    let mut changes = ChangeSet::default();

    match input {
        Input::BeginSnapshot => {
            next.snapshot_requested = true;
            next.touched.clear();
        }
        Input::Snapshot(tasks) => apply_snapshot(&mut next, tasks, &mut changes),
        Input::Remote(MutationEvent::Created(task) | MutationEvent::Updated(task)) => {
            apply_remote_upsert(&mut next, task, &mut changes);
        }
        Input::Remote(MutationEvent::Deleted(id)) => apply_remote_delete(&mut next, id, &mut changes),
        Input::Local { event, now } => apply_local(&mut next, event, now, &mut changes),
        Input::ConfirmCreate {
            provisional,
            confirmed,
        } => {
            if provisional != &confirmed.id {
                next.pending.remove(provisional);
                if let Some(removed) = next.tasks.remove(provisional) {
                    changes.record(provisional, Some(&removed), None);
                }
            }
            apply_remote_upsert(&mut next, confirmed, &mut changes);
        }
        Input::Rollback { id, at } => apply_rollback(&mut next, id, at, &mut changes),
    }

    changes.sort();
    Reconciled {
        state: next,
        changes,
    }
}

fn apply_remote_upsert(state: &mut SyncState, incoming: &Task, changes: &mut ChangeSet) {
    let id = &incoming.id;
    let current = state.tasks.get(id);

    let newer = match current {
        // A server record stamped exactly like the pending local write is its
        // confirmation and settles it.
        Some(held) => {
            incoming.updated_at > held.updated_at
                || (incoming.updated_at == held.updated_at
                    && state
                        .pending
                        .get(id)
                        .is_some_and(|p| p.kind == PendingKind::Upsert && p.at == held.updated_at))
        }
        None => match state.pending.get(id) {
            Some(p) if p.kind == PendingKind::Delete => incoming.updated_at > p.at,
            _ => true,
        },
    };
    if !newer {
        tracing::trace!(task_id = %id, updated_at = %incoming.updated_at, "stale record discarded");
        return;
    }

    state.pending.remove(id);
    if state.snapshot_requested {
        state.touched.insert(id.clone(), Touch::Upserted);
    }
    let before = state.tasks.insert(incoming.clone());
    changes.record(id, before.as_ref(), Some(incoming));
}

fn apply_remote_delete(state: &mut SyncState, id: &TaskId, changes: &mut ChangeSet) {
    state.pending.remove(id);
    let before = state.tasks.remove(id);
    if state.snapshot_requested {
        state
            .touched
            .insert(id.clone(), Touch::Deleted(before.as_ref().map(|t| t.updated_at)));
    }
    changes.record(id, before.as_ref(), None);
}

/// Stamp for a local write: `now`, but never before `created_at` and always
/// after the held entry.
fn local_stamp(now: Timestamp, created_at: Timestamp, held: Option<&Task>) -> Timestamp {
    let floor = held.map_or(created_at, |h| h.updated_at.next().max(created_at));
    now.max(floor)
}

fn apply_local(state: &mut SyncState, event: &MutationEvent, now: Timestamp, changes: &mut ChangeSet) {
    match event {
        MutationEvent::Created(task) | MutationEvent::Updated(task) => {
            let prior = state.tasks.get(&task.id).cloned();
            let mut stamped = task.clone();
            if let Some(held) = &prior {
                // The server owns creation metadata.
                stamped.created_at = held.created_at;
            }
            stamped.updated_at = local_stamp(now, stamped.created_at, prior.as_ref());
            state.pending.insert(
                task.id.clone(),
                PendingMutation {
                    at: stamped.updated_at,
                    kind: PendingKind::Upsert,
                    prior: prior.clone(),
                },
            );
            state.tasks.insert(stamped.clone());
            changes.record(&task.id, prior.as_ref(), Some(&stamped));
        }
        MutationEvent::Deleted(id) => {
            let Some(prior) = state.tasks.remove(id) else {
                return;
            };
            let at = local_stamp(now, prior.created_at, Some(&prior));
            changes.record(id, Some(&prior), None);
            state.pending.insert(
                id.clone(),
                PendingMutation {
                    at,
                    kind: PendingKind::Delete,
                    prior: Some(prior),
                },
            );
        }
    }
}

fn apply_rollback(state: &mut SyncState, id: &TaskId, at: Timestamp, changes: &mut ChangeSet) {
    let Some(pending) = state.pending.get(id) else {
        return;
    };
    if pending.at != at {
        tracing::debug!(task_id = %id, "rollback skipped, superseded by a later write");
        return;
    }
    let Some(pending) = state.pending.remove(id) else {
        return;
    };
    let before = match pending.prior {
        Some(prior) => state.tasks.insert(prior),
        None => state.tasks.remove(id),
    };
    changes.record(id, before.as_ref(), state.tasks.get(id));
}

fn apply_snapshot(state: &mut SyncState, snapshot: &[Task], changes: &mut ChangeSet) {
    let mut incoming: HashMap<&TaskId, &Task> = HashMap::with_capacity(snapshot.len());
    for task in snapshot {
        incoming
            .entry(&task.id)
            .and_modify(|seen| {
                if task.updated_at > seen.updated_at {
                    *seen = task;
                }
            })
            .or_insert(task);
    }

    let mut next = TaskCollection::new();
    for task in incoming.values() {
        next.insert((*task).clone());
    }

    // Held entries that survive the replace.
    for held in state.tasks.iter() {
        let keep = match incoming.get(&held.id) {
            Some(fetched) => held.updated_at > fetched.updated_at,
            None => {
                state
                    .pending
                    .get(&held.id)
                    .is_some_and(|p| p.kind == PendingKind::Upsert)
                    || state.touched.get(&held.id) == Some(&Touch::Upserted)
            }
        };
        if keep {
            next.insert(held.clone());
        }
    }

    // Ids deleted locally or by push that the snapshot still shows.
    let mut superseded = Vec::new();
    for (id, pending) in &state.pending {
        match pending.kind {
            PendingKind::Delete => match incoming.get(id) {
                Some(fetched) if fetched.updated_at > pending.at => superseded.push(id.clone()),
                Some(_) => {
                    next.remove(id);
                }
                None => {}
            },
            PendingKind::Upsert => {
                let settled = incoming.get(id).is_some_and(|f| f.updated_at >= pending.at);
                if settled || next.get(id).is_none_or(|kept| kept.updated_at != pending.at) {
                    superseded.push(id.clone());
                }
            }
        }
    }
    for (id, touch) in &state.touched {
        if let Touch::Deleted(last_seen) = touch
            && let Some(fetched) = incoming.get(id)
            && last_seen.is_none_or(|seen| fetched.updated_at <= seen)
        {
            next.remove(id);
        }
    }
    for id in superseded {
        state.pending.remove(&id);
    }

    for held in state.tasks.iter() {
        changes.record(&held.id, Some(held), next.get(&held.id));
    }
    for task in next.iter() {
        if !state.tasks.contains(&task.id) {
            changes.record(&task.id, None, Some(task));
        }
    }

    state.tasks = next;
    state.touched.clear();
    state.snapshot_requested = false;
}
