//! `tasksync`: keeps a client-side task collection in sync with a backend
//! through a snapshot fetch plus a live push channel.

pub mod api;
pub mod bus;
pub mod clock;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod tasks;
pub mod transport;
