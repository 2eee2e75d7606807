//! In-process task backend.
//!
//! Behaves like the hosted API: ids are assigned on create, `updated_at` is
//! stamped on every write, unset draft fields default to
//! `"Untitled Task"`/`todo`/`medium`, and updating an unknown id fails with
//! `Task not found`. Every successful write is also published on
//! [`InMemoryTaskApi::mutations`] so a test or demo can forward it to a push
//! channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use tasksync_proto::task::{
    MutationEvent, Priority, Task, TaskDraft, TaskId, TaskPatch, TaskStatus, Timestamp, User,
};

use super::{ApiError, TaskApi};
use crate::bus::EventBus;
use crate::clock::{Clock, SystemClock};

/// Longest title the backend accepts.
pub const MAX_TITLE_LEN: usize = 256;

const DAY_MS: u64 = 86_400_000;

/// Task backend held in memory.
pub struct InMemoryTaskApi<C: Clock = SystemClock> {
    tasks: Mutex<Vec<Task>>,
    current_user: User,
    clock: C,
    latency: Mutex<Duration>,
    failures: AtomicU32,
    next_id: AtomicU64,
    requests: AtomicU64,
    mutations: Arc<EventBus<MutationEvent>>,
}

impl InMemoryTaskApi<SystemClock> {
    /// An empty backend acting as `current_user`, stamping with the system clock.
    #[must_use]
    pub fn new(current_user: User) -> Self {
        Self::with_clock(current_user, SystemClock)
    }

    /// A backend pre-loaded with three users' worth of demo tasks.
    #[must_use]
    pub fn with_demo_data() -> Self {
        let api = Self::new(demo_users()[0].clone());
        api.seed(demo_tasks(Timestamp::now()));
        api
    }
}

impl<C: Clock> InMemoryTaskApi<C> {
    /// An empty backend using `clock` for write stamps.
    pub fn with_clock(current_user: User, clock: C) -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
            current_user,
            clock,
            latency: Mutex::new(Duration::ZERO),
            failures: AtomicU32::new(0),
            next_id: AtomicU64::new(1),
            requests: AtomicU64::new(0),
            mutations: Arc::new(EventBus::new()),
        }
    }

    /// Replaces the stored tasks. Invalid records are skipped with a warning.
    pub fn seed(&self, tasks: impl IntoIterator<Item = Task>) {
        let mut stored = self.tasks.lock();
        stored.clear();
        for task in tasks {
            match task.validate() {
                Ok(()) => stored.push(task),
                Err(e) => tracing::warn!(error = %e, "skipping invalid seed task"),
            }
        }
    }

    /// Delays every request by `latency` (uses `tokio::time`).
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Makes the next `n` requests fail with [`ApiError::Network`].
    pub fn fail_next_requests(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Bus receiving every successful write as a mutation event.
    #[must_use]
    pub fn mutations(&self) -> Arc<EventBus<MutationEvent>> {
        Arc::clone(&self.mutations)
    }

    /// Copy of the stored tasks, in insertion order.
    #[must_use]
    pub fn stored(&self) -> Vec<Task> {
        self.tasks.lock().clone()
    }

    /// Number of requests received, including failed ones.
    #[must_use]
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    /// The user new tasks are attributed to.
    #[must_use]
    pub const fn current_user(&self) -> &User {
        &self.current_user
    }

    /// Simulated latency and failure injection shared by every call.
    async fn begin_request(&self, op: &'static str) -> Result<(), ApiError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            tracing::debug!(op, "injected API failure");
            return Err(ApiError::Network(format!("{op}: injected failure")));
        }
        Ok(())
    }

    fn mint_id(&self, stored: &[Task]) -> TaskId {
        loop {
            let id = TaskId::new(self.next_id.fetch_add(1, Ordering::SeqCst).to_string());
            if !stored.iter().any(|t| t.id == id) {
                return id;
            }
        }
    }

    fn check_title(title: Option<&str>) -> Result<(), ApiError> {
        match title {
            Some(t) if t.chars().count() > MAX_TITLE_LEN => Err(ApiError::Rejected(format!(
                "title exceeds {MAX_TITLE_LEN} characters"
            ))),
            _ => Ok(()),
        }
    }
}

impl<C: Clock> TaskApi for InMemoryTaskApi<C> {
    async fn fetch_all_tasks(&self) -> Result<Vec<Task>, ApiError> {
        self.begin_request("fetch_all_tasks").await?;
        Ok(self.stored())
    }

    async fn create_task(&self, mut draft: TaskDraft) -> Result<Task, ApiError> {
        self.begin_request("create_task").await?;
        Self::check_title(draft.title.as_deref())?;
        if draft.title.as_deref().is_some_and(str::is_empty) {
            draft.title = None;
        }

        let task = {
            let mut stored = self.tasks.lock();
            let id = self.mint_id(&stored);
            let task = draft.into_task(id, self.current_user.clone(), self.clock.now());
            stored.push(task.clone());
            task
        };
        tracing::debug!(task_id = %task.id, "task created");
        self.mutations.publish(&MutationEvent::Created(task.clone()));
        Ok(task)
    }

    async fn update_task(&self, id: &TaskId, patch: TaskPatch) -> Result<Task, ApiError> {
        self.begin_request("update_task").await?;
        Self::check_title(patch.title.as_deref())?;

        let updated = {
            let mut stored = self.tasks.lock();
            let Some(slot) = stored.iter_mut().find(|t| &t.id == id) else {
                return Err(ApiError::NotFound(id.clone()));
            };
            let now = self.clock.now().max(slot.updated_at.next());
            *slot = patch.apply(slot, now);
            slot.clone()
        };
        tracing::debug!(task_id = %id, updated_at = %updated.updated_at, "task updated");
        self.mutations.publish(&MutationEvent::Updated(updated.clone()));
        Ok(updated)
    }

    async fn delete_task(&self, id: &TaskId) -> Result<(), ApiError> {
        self.begin_request("delete_task").await?;
        let removed = {
            let mut stored = self.tasks.lock();
            let before = stored.len();
            stored.retain(|t| &t.id != id);
            stored.len() != before
        };
        if removed {
            tracing::debug!(task_id = %id, "task deleted");
            self.mutations.publish(&MutationEvent::Deleted(id.clone()));
        }
        Ok(())
    }
}

/// The three demo users.
#[must_use]
pub fn demo_users() -> [User; 3] {
    let mut john = User::new("1", "John Doe", "john@example.com");
    john.avatar_url = Some("https://i.pravatar.cc/150?img=1".to_string());
    let mut jane = User::new("2", "Jane Smith", "jane@example.com");
    jane.avatar_url = Some("https://i.pravatar.cc/150?img=5".to_string());
    let mut alex = User::new("3", "Alex Johnson", "alex@example.com");
    alex.avatar_url = Some("https://i.pravatar.cc/150?img=8".to_string());
    [john, jane, alex]
}

/// Demo tasks with timestamps relative to `now`.
#[must_use]
pub fn demo_tasks(now: Timestamp) -> Vec<Task> {
    let [john, jane, alex] = demo_users();
    let ago = |ms: u64| Timestamp::from_millis(now.as_millis().saturating_sub(ms));
    let ahead = |ms: u64| Timestamp::from_millis(now.as_millis().saturating_add(ms));
    let tags = |list: &[&str]| list.iter().map(|t| (*t).to_string()).collect();

    vec![
        Task {
            id: TaskId::new("1"),
            title: "Complete project proposal".to_string(),
            description: "Draft the initial project proposal with timeline and budget estimates."
                .to_string(),
            status: TaskStatus::InProgress,
            priority: Priority::High,
            assigned_to: Some(john.clone()),
            created_by: jane.clone(),
            created_at: ago(2 * DAY_MS),
            updated_at: ago(DAY_MS / 2),
            due_date: Some(ahead(2 * DAY_MS)),
            tags: tags(&["proposal", "planning"]),
        },
        Task {
            id: TaskId::new("2"),
            title: "Design user interface mockups".to_string(),
            description: "Create wireframes and high-fidelity mockups for the main user flows."
                .to_string(),
            status: TaskStatus::Todo,
            priority: Priority::Medium,
            assigned_to: Some(jane),
            created_by: john.clone(),
            created_at: ago(DAY_MS),
            updated_at: ago(DAY_MS),
            due_date: Some(ahead(5 * DAY_MS)),
            tags: tags(&["design", "ui/ux"]),
        },
        Task {
            id: TaskId::new("3"),
            title: "Set up deployment pipeline".to_string(),
            description: "Configure the CI/CD pipeline for automated testing and deployment."
                .to_string(),
            status: TaskStatus::Completed,
            priority: Priority::High,
            assigned_to: Some(alex),
            created_by: john,
            created_at: ago(5 * DAY_MS),
            updated_at: ago(DAY_MS),
            due_date: Some(ago(DAY_MS)),
            tags: tags(&["devops", "infrastructure"]),
        },
    ]
}
