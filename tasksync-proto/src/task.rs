//! Task record types shared by the sync client and the push relay.
//!
//! A [`Task`] embeds full [`User`] copies for its creator and assignee. These
//! are snapshots taken when the record was written, not live references: two
//! tasks may carry different versions of the same user and nothing ever
//! reconciles them.

use std::collections::BTreeSet;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Prefix for identifiers minted locally before the server assigns one.
pub const PROVISIONAL_ID_PREFIX: &str = "local-";

/// Title used when a draft does not provide one.
pub const DEFAULT_TASK_TITLE: &str = "Untitled Task";

/// Opaque, server-assigned task identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Wraps an identifier received from the server.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mints a provisional identifier for an optimistic local create.
    ///
    /// Provisional ids are UUID v7 based, so two creates issued in the same
    /// millisecond still get distinct keys.
    #[must_use]
    pub fn provisional() -> Self {
        Self(format!("{PROVISIONAL_ID_PREFIX}{}", Uuid::now_v7()))
    }

    /// Whether this id was minted locally and is still awaiting a server id.
    #[must_use]
    pub fn is_provisional(&self) -> bool {
        self.0.starts_with(PROVISIONAL_ID_PREFIX)
    }

    /// Returns the string form of the identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Milliseconds since the UNIX epoch.
///
/// Human-readable formats (JSON) carry an RFC 3339 string such as
/// `"2024-05-01T10:00:00.000Z"`; integer milliseconds are accepted on input
/// too. Binary formats carry the raw `u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current wall-clock instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the number of milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// The smallest timestamp strictly later than `self`.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl Timestamp {
    /// RFC 3339 form in UTC with millisecond precision, if representable.
    #[must_use]
    pub fn to_rfc3339(self) -> Option<String> {
        let millis = i64::try_from(self.0).ok()?;
        DateTime::<Utc>::from_timestamp_millis(millis)
            .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    /// Parses an RFC 3339 date-time; instants before the epoch are rejected.
    ///
    /// # Errors
    ///
    /// Returns the parse error text if `text` is not RFC 3339 or lies
    /// before 1970-01-01.
    pub fn parse_rfc3339(text: &str) -> Result<Self, String> {
        let dt = DateTime::parse_from_rfc3339(text).map_err(|e| e.to_string())?;
        u64::try_from(dt.timestamp_millis())
            .map(Self)
            .map_err(|_| format!("{text} is before the UNIX epoch"))
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable()
            && let Some(text) = self.to_rfc3339()
        {
            return serializer.serialize_str(&text);
        }
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            deserializer.deserialize_any(TimestampVisitor)
        } else {
            deserializer.deserialize_u64(TimestampVisitor)
        }
    }
}

struct TimestampVisitor;

impl Visitor<'_> for TimestampVisitor {
    type Value = Timestamp;

    fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("an RFC 3339 date-time or milliseconds since the UNIX epoch")
    }

    fn visit_u64<E: de::Error>(self, millis: u64) -> Result<Timestamp, E> {
        Ok(Timestamp(millis))
    }

    fn visit_i64<E: de::Error>(self, millis: i64) -> Result<Timestamp, E> {
        u64::try_from(millis)
            .map(Timestamp)
            .map_err(|_| E::invalid_value(de::Unexpected::Signed(millis), &self))
    }

    fn visit_str<E: de::Error>(self, text: &str) -> Result<Timestamp, E> {
        Timestamp::parse_rfc3339(text).map_err(E::custom)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Denormalized user record embedded in tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Server-assigned user identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Contact address.
    pub email: String,
    /// Optional avatar image reference.
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl User {
    /// Creates a user without an avatar.
    pub fn new(id: impl Into<String>, name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: email.into(),
            avatar_url: None,
        }
    }
}

/// Workflow status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// Not started.
    #[default]
    Todo,
    /// Actively being worked on.
    InProgress,
    /// Done.
    Completed,
}

impl TaskStatus {
    /// The status a single "advance" click moves to.
    ///
    /// The cycle wraps: `todo -> in-progress -> completed -> todo`.
    #[must_use]
    pub const fn next(self) -> Self {
        match self {
            Self::Todo => Self::InProgress,
            Self::InProgress => Self::Completed,
            Self::Completed => Self::Todo,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Todo => write!(f, "todo"),
            Self::InProgress => write!(f, "in-progress"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// Task priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Low priority.
    Low,
    /// Medium priority.
    #[default]
    Medium,
    /// High priority.
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Reasons a task record is rejected as malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskInvariantError {
    /// The identifier is empty.
    #[error("task id is empty")]
    EmptyId,
    /// `updated_at` precedes `created_at`.
    #[error("task {id} updated at {updated_at} before it was created at {created_at}")]
    UpdatedBeforeCreated {
        /// Offending task.
        id: TaskId,
        /// Creation time.
        created_at: Timestamp,
        /// Last update time.
        updated_at: Timestamp,
    },
}

/// A task record as held by the server and mirrored by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Stable identifier.
    pub id: TaskId,
    /// Short title.
    pub title: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Workflow status.
    pub status: TaskStatus,
    /// Priority.
    pub priority: Priority,
    /// Assignee snapshot, if any.
    #[serde(default)]
    pub assigned_to: Option<User>,
    /// Creator snapshot.
    pub created_by: User,
    /// Creation time.
    pub created_at: Timestamp,
    /// Time of the last write; drives last-write-wins reconciliation.
    pub updated_at: Timestamp,
    /// Optional deadline.
    #[serde(default)]
    pub due_date: Option<Timestamp>,
    /// Tags, deduplicated.
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl Task {
    /// Checks the record-level invariants.
    ///
    /// # Errors
    ///
    /// Returns [`TaskInvariantError`] if the id is empty or `updated_at`
    /// precedes `created_at`.
    pub fn validate(&self) -> Result<(), TaskInvariantError> {
        if self.id.as_str().is_empty() {
            return Err(TaskInvariantError::EmptyId);
        }
        if self.updated_at < self.created_at {
            return Err(TaskInvariantError::UpdatedBeforeCreated {
                id: self.id.clone(),
                created_at: self.created_at,
                updated_at: self.updated_at,
            });
        }
        Ok(())
    }

    /// Whether the task is past its due date at `now` and not yet completed.
    #[must_use]
    pub fn is_overdue(&self, now: Timestamp) -> bool {
        self.status != TaskStatus::Completed && self.due_date.is_some_and(|due| now > due)
    }

    /// Case-insensitive match against title, description, and tags.
    #[must_use]
    pub fn matches(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.title.to_lowercase().contains(&needle)
            || self.description.to_lowercase().contains(&needle)
            || self.tags.iter().any(|t| t.to_lowercase().contains(&needle))
    }
}

/// Fields for a create request; unset fields take server defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskDraft {
    /// Title (defaults to [`DEFAULT_TASK_TITLE`]).
    pub title: Option<String>,
    /// Description (defaults to empty).
    pub description: Option<String>,
    /// Status (defaults to `todo`).
    pub status: Option<TaskStatus>,
    /// Priority (defaults to `medium`).
    pub priority: Option<Priority>,
    /// Assignee.
    pub assigned_to: Option<User>,
    /// Deadline.
    pub due_date: Option<Timestamp>,
    /// Tags.
    pub tags: BTreeSet<String>,
}

impl TaskDraft {
    /// Starts a draft with the given title.
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    /// Materializes the draft into a full record.
    #[must_use]
    pub fn into_task(self, id: TaskId, created_by: User, now: Timestamp) -> Task {
        Task {
            id,
            title: self
                .title
                .unwrap_or_else(|| DEFAULT_TASK_TITLE.to_string()),
            description: self.description.unwrap_or_default(),
            status: self.status.unwrap_or_default(),
            priority: self.priority.unwrap_or_default(),
            assigned_to: self.assigned_to,
            created_by,
            created_at: now,
            updated_at: now,
            due_date: self.due_date,
            tags: self.tags,
        }
    }
}

/// A partial update; `None` leaves the field unchanged.
///
/// `assigned_to` and `due_date` are doubly optional so a patch can clear them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskPatch {
    /// New title.
    pub title: Option<String>,
    /// New description.
    pub description: Option<String>,
    /// New status.
    pub status: Option<TaskStatus>,
    /// New priority.
    pub priority: Option<Priority>,
    /// New assignee (`Some(None)` unassigns).
    pub assigned_to: Option<Option<User>>,
    /// New deadline (`Some(None)` clears it).
    pub due_date: Option<Option<Timestamp>>,
    /// Replacement tag set.
    pub tags: Option<BTreeSet<String>>,
}

impl TaskPatch {
    /// A patch that only changes the status.
    #[must_use]
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Returns a copy of `task` with the patch applied and `updated_at` set
    /// to `now`.
    #[must_use]
    pub fn apply(&self, task: &Task, now: Timestamp) -> Task {
        let mut next = task.clone();
        if let Some(title) = &self.title {
            next.title.clone_from(title);
        }
        if let Some(description) = &self.description {
            next.description.clone_from(description);
        }
        if let Some(status) = self.status {
            next.status = status;
        }
        if let Some(priority) = self.priority {
            next.priority = priority;
        }
        if let Some(assigned_to) = &self.assigned_to {
            next.assigned_to.clone_from(assigned_to);
        }
        if let Some(due_date) = self.due_date {
            next.due_date = due_date;
        }
        if let Some(tags) = &self.tags {
            next.tags.clone_from(tags);
        }
        next.updated_at = now;
        next
    }
}

/// A mutation announced by the server or issued locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationEvent {
    /// A task was created.
    Created(Task),
    /// A task was updated; carries the full new record.
    Updated(Task),
    /// A task was deleted.
    Deleted(TaskId),
}

impl MutationEvent {
    /// The identifier of the task this event concerns.
    #[must_use]
    pub const fn task_id(&self) -> &TaskId {
        match self {
            Self::Created(task) | Self::Updated(task) => &task.id,
            Self::Deleted(id) => id,
        }
    }

    /// The carried record, if any.
    #[must_use]
    pub const fn task(&self) -> Option<&Task> {
        match self {
            Self::Created(task) | Self::Updated(task) => Some(task),
            Self::Deleted(_) => None,
        }
    }

    /// Short name used in log fields.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Created(_) => "created",
            Self::Updated(_) => "updated",
            Self::Deleted(_) => "deleted",
        }
    }
}
