//! `SynqX` mailbox service library.
//!
//! Exposes the mailbox service for use in tests and embedding. The service
//! keeps a tree of keyed values, answers read/write/list requests over a
//! WebSocket, and pushes change notifications to watchers.

pub mod config;
pub mod server;
pub mod store;
