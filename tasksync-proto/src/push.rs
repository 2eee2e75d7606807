//! Encoding and decoding of push-channel mutation frames.
//!
//! Two encodings share one event model:
//!
//! - **Text frames** carry JSON shaped `{"type": "TASK_CREATED", "payload": {...}}`
//!   (`TASK_UPDATED` likewise; `TASK_DELETED` carries `{"id": "..."}`).
//! - **Binary frames** carry the same [`MutationEvent`] encoded with postcard.
//!
//! Every decoded record is checked with [`Task::validate`]; a frame that
//! parses but breaks a record invariant is reported as malformed.

use serde::{Deserialize, Serialize};

use crate::task::{MutationEvent, Task, TaskId, TaskInvariantError};

/// Error type for frame encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The frame parsed but carries an invalid record.
    #[error("invalid task record: {0}")]
    Invalid(#[from] TaskInvariantError),
}

/// JSON wire shape of a push notification.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
enum PushMessage {
    TaskCreated(Task),
    TaskUpdated(Task),
    TaskDeleted(DeletedPayload),
}

#[derive(Debug, Serialize, Deserialize)]
struct DeletedPayload {
    id: TaskId,
}

impl From<PushMessage> for MutationEvent {
    fn from(msg: PushMessage) -> Self {
        match msg {
            PushMessage::TaskCreated(task) => Self::Created(task),
            PushMessage::TaskUpdated(task) => Self::Updated(task),
            PushMessage::TaskDeleted(DeletedPayload { id }) => Self::Deleted(id),
        }
    }
}

impl From<&MutationEvent> for PushMessage {
    fn from(event: &MutationEvent) -> Self {
        match event {
            MutationEvent::Created(task) => Self::TaskCreated(task.clone()),
            MutationEvent::Updated(task) => Self::TaskUpdated(task.clone()),
            MutationEvent::Deleted(id) => Self::TaskDeleted(DeletedPayload { id: id.clone() }),
        }
    }
}

/// Encodes a [`MutationEvent`] as a JSON text frame.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the event cannot be serialized.
pub fn encode_json(event: &MutationEvent) -> Result<String, CodecError> {
    serde_json::to_string(&PushMessage::from(event))
        .map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a JSON text frame into a validated [`MutationEvent`].
///
/// # Errors
///
/// Returns `CodecError::Serialization` for unparseable JSON or unknown event
/// types, and `CodecError::Invalid` if the carried task breaks an invariant.
pub fn decode_json(text: &str) -> Result<MutationEvent, CodecError> {
    let msg: PushMessage =
        serde_json::from_str(text).map_err(|e| CodecError::Serialization(e.to_string()))?;
    validated(msg.into())
}

/// Encodes a [`MutationEvent`] as a postcard binary frame.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the event cannot be serialized.
pub fn encode_binary(event: &MutationEvent) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(event).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a postcard binary frame into a validated [`MutationEvent`].
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the bytes cannot be deserialized,
/// and `CodecError::Invalid` if the carried task breaks an invariant.
pub fn decode_binary(bytes: &[u8]) -> Result<MutationEvent, CodecError> {
    let event: MutationEvent =
        postcard::from_bytes(bytes).map_err(|e| CodecError::Serialization(e.to_string()))?;
    validated(event)
}

/// Parses a JSON array of tasks, as returned by a bulk snapshot fetch.
///
/// # Errors
///
/// Returns `CodecError::Serialization` for unparseable JSON and
/// `CodecError::Invalid` for the first task that breaks an invariant.
pub fn decode_snapshot_json(text: &str) -> Result<Vec<Task>, CodecError> {
    let tasks: Vec<Task> =
        serde_json::from_str(text).map_err(|e| CodecError::Serialization(e.to_string()))?;
    for task in &tasks {
        task.validate()?;
    }
    Ok(tasks)
}

fn validated(event: MutationEvent) -> Result<MutationEvent, CodecError> {
    match &event {
        MutationEvent::Created(task) | MutationEvent::Updated(task) => task.validate()?,
        MutationEvent::Deleted(id) => {
            if id.as_str().is_empty() {
                return Err(TaskInvariantError::EmptyId.into());
            }
        }
    }
    Ok(event)
}
