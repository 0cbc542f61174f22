//! Shared message model and mailbox wire protocol for `SynqX`.

pub mod codec;
pub mod mailbox;
pub mod message;
pub mod path;
pub mod tree;
