//! Immutable, cheaply cloned task map.

use std::collections::HashMap;
use std::sync::Arc;

use tasksync_proto::task::{Priority, Task, TaskId, TaskStatus};

/// Mapping from task id to task.
///
/// Clones share storage; [`insert`](Self::insert) and
/// [`remove`](Self::remove) copy the map only when it is shared, so a
/// snapshot handed to a consumer never changes underneath it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskCollection {
    tasks: Arc<HashMap<TaskId, Task>>,
}

/// Field used by [`TaskCollection::sorted_by`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    /// Newest first.
    CreatedAt,
    /// Most recently updated first.
    UpdatedAt,
    /// Earliest deadline first; tasks without one last.
    DueDate,
    /// Case-insensitive title.
    Title,
}

/// Search-box and status-tab filter used by list views.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    /// Case-insensitive substring of title, description, or a tag.
    pub search: Option<String>,
    /// Only tasks in this status; `None` means all.
    pub status: Option<TaskStatus>,
}

impl TaskFilter {
    /// Whether `task` passes the filter.
    #[must_use]
    pub fn accepts(&self, task: &Task) -> bool {
        let matches_search = self
            .search
            .as_deref()
            .is_none_or(|needle| task.matches(needle));
        matches_search && self.status.is_none_or(|s| task.status == s)
    }
}

/// Tasks split into priority sections, each ordered newest first.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PriorityGroups<'a> {
    /// High priority.
    pub high: Vec<&'a Task>,
    /// Medium priority.
    pub medium: Vec<&'a Task>,
    /// Low priority.
    pub low: Vec<&'a Task>,
}

impl PriorityGroups<'_> {
    /// Total number of tasks across all sections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.high.len() + self.medium.len() + self.low.len()
    }

    /// Whether every section is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TaskCollection {
    /// An empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a task.
    #[must_use]
    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Whether `id` is present.
    #[must_use]
    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    /// Number of tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the collection is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Iterates tasks in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// Whether `self` and `other` share storage.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.tasks, &other.tasks)
    }

    /// Inserts or replaces a task, returning the previous one.
    pub fn insert(&mut self, task: Task) -> Option<Task> {
        Arc::make_mut(&mut self.tasks).insert(task.id.clone(), task)
    }

    /// Removes a task.
    pub fn remove(&mut self, id: &TaskId) -> Option<Task> {
        if !self.tasks.contains_key(id) {
            return None;
        }
        Arc::make_mut(&mut self.tasks).remove(id)
    }

    /// All tasks ordered by `key`, ties broken by id.
    #[must_use]
    pub fn sorted_by(&self, key: SortKey) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by(|a, b| {
            let primary = match key {
                SortKey::CreatedAt => b.created_at.cmp(&a.created_at),
                SortKey::UpdatedAt => b.updated_at.cmp(&a.updated_at),
                SortKey::DueDate => match (a.due_date, b.due_date) {
                    (Some(x), Some(y)) => x.cmp(&y),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                },
                SortKey::Title => a.title.to_lowercase().cmp(&b.title.to_lowercase()),
            };
            primary.then_with(|| a.id.cmp(&b.id))
        });
        tasks
    }

    /// Tasks passing `filter`, newest first.
    #[must_use]
    pub fn filter(&self, filter: &TaskFilter) -> Vec<&Task> {
        self.sorted_by(SortKey::CreatedAt)
            .into_iter()
            .filter(|t| filter.accepts(t))
            .collect()
    }

    /// Tasks passing `filter`, grouped by priority.
    #[must_use]
    pub fn by_priority(&self, filter: &TaskFilter) -> PriorityGroups<'_> {
        let mut groups = PriorityGroups::default();
        for task in self.filter(filter) {
            match task.priority {
                Priority::High => groups.high.push(task),
                Priority::Medium => groups.medium.push(task),
                Priority::Low => groups.low.push(task),
            }
        }
        groups
    }
}

impl FromIterator<Task> for TaskCollection {
    fn from_iter<I: IntoIterator<Item = Task>>(iter: I) -> Self {
        Self {
            tasks: Arc::new(iter.into_iter().map(|t| (t.id.clone(), t)).collect()),
        }
    }
}
