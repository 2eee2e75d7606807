//! Shared record and wire definitions for `tasksync`.

pub mod push;
pub mod task;
