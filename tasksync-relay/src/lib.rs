//! `tasksync-relay` library.
//!
//! Exposes the push relay for use in tests and embedding. Clients connect
//! over WebSocket; every valid mutation frame one client sends is fanned out
//! to the others.

pub mod config;
pub mod relay;
