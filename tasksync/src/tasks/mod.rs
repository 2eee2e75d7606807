//! Client-side task state.
//!
//! [`TaskCollection`] is the immutable view handed to consumers;
//! [`merge::reconcile`] is the only way it changes.

pub mod collection;
pub mod merge;

pub use collection::{PriorityGroups, SortKey, TaskCollection, TaskFilter};
pub use merge::{
    ChangeSet, Input, PendingKind, PendingMutation, Reconciled, SyncState, reconcile,
};
