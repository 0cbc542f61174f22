//! Durable client-side storage.
//!
//! - [`persistence`]: string blobs under string keys, the client's equivalent
//!   of browser local storage
//! - [`cache`]: the per-conversation message log built on top of it

pub mod cache;
pub mod persistence;
