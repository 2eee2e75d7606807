//! Request/response collaborator for the task backend.
//!
//! The sync coordinator only needs the four calls on [`TaskApi`]; how they
//! reach the server is up to the implementation. [`memory::InMemoryTaskApi`]
//! keeps everything in process.

pub mod memory;

use std::future::Future;
use std::sync::Arc;

use tasksync_proto::task::{Task, TaskDraft, TaskId, TaskPatch};

/// Errors returned by [`TaskApi`] calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// The request did not reach the server or timed out; retrying may help.
    #[error("network error: {0}")]
    Network(String),

    /// The addressed task does not exist.
    #[error("Task not found: {0}")]
    NotFound(TaskId),

    /// The server refused the request.
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl ApiError {
    /// Whether the failure is worth retrying.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

/// The task backend's request interface.
pub trait TaskApi: Send + Sync + 'static {
    /// Fetches every task visible to the current user.
    fn fetch_all_tasks(&self) -> impl Future<Output = Result<Vec<Task>, ApiError>> + Send;

    /// Creates a task; unset draft fields take server defaults.
    fn create_task(&self, draft: TaskDraft) -> impl Future<Output = Result<Task, ApiError>> + Send;

    /// Applies a partial update and returns the stored record.
    fn update_task(
        &self,
        id: &TaskId,
        patch: TaskPatch,
    ) -> impl Future<Output = Result<Task, ApiError>> + Send;

    /// Deletes a task. Deleting an unknown id succeeds.
    fn delete_task(&self, id: &TaskId) -> impl Future<Output = Result<(), ApiError>> + Send;
}

/// Lets several clients share one backend.
impl<T: TaskApi> TaskApi for Arc<T> {
    fn fetch_all_tasks(&self) -> impl Future<Output = Result<Vec<Task>, ApiError>> + Send {
        (**self).fetch_all_tasks()
    }

    fn create_task(&self, draft: TaskDraft) -> impl Future<Output = Result<Task, ApiError>> + Send {
        (**self).create_task(draft)
    }

    fn update_task(
        &self,
        id: &TaskId,
        patch: TaskPatch,
    ) -> impl Future<Output = Result<Task, ApiError>> + Send {
        (**self).update_task(id, patch)
    }

    fn delete_task(&self, id: &TaskId) -> impl Future<Output = Result<(), ApiError>> + Send {
        (**self).delete_task(id)
    }
}
