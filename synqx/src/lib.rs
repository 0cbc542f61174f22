//! `SynqX` client core.
//!
//! The message delivery pipeline of a chat client: an outbound send queue
//! with retry and backoff, a delivery handshake over a shared mailbox store,
//! connection quality tracking, a local per-conversation cache, and a
//! history reconciler that merges all message sources into one view.
//!
//! [`client::SynqxClient`] wires the pieces together; each module can also be
//! used on its own with injected dependencies.

pub mod client;
pub mod clock;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod event;
pub mod history;
pub mod mailbox;
pub mod queue;
pub mod router;
pub mod storage;
