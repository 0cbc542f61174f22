//! Access to the remote mailbox store.
//!
//! Defines the [`Mailbox`] trait that the rest of the client depends on.
//! Implementations:
//! - [`memory::MemoryMailbox`]: in-process store shared between simulated
//!   users, with fault injection for tests
//! - [`remote::RemoteMailbox`]: WebSocket client for the `synqx-mailbox`
//!   service

pub mod memory;
pub mod remote;

use std::future::Future;

use synqx_proto::codec::CodecError;
use synqx_proto::mailbox::{ChildEntry, MailboxEvent, MailboxValue, PathChange};
use synqx_proto::path::{MailboxPath, PathError};
use tokio::sync::{mpsc, watch};

/// Errors that can occur during mailbox operations.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    /// The mailbox could not be reached.
    #[error("mailbox unreachable: {0}")]
    Unreachable(String),

    /// The mailbox refused the request.
    #[error("mailbox rejected request: {0}")]
    Rejected(String),

    /// No reply arrived in time.
    #[error("mailbox operation timed out")]
    Timeout,

    /// The connection to the mailbox has been closed.
    #[error("mailbox connection closed")]
    ConnectionClosed,

    /// A frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// A path could not be built from the given identifiers.
    #[error("invalid path: {0}")]
    InvalidPath(#[from] PathError),

    /// The mailbox URL is malformed or uses an unsupported scheme.
    #[error("invalid mailbox URL: {0}")]
    InvalidUrl(String),
}

/// Async access to a keyed mailbox store with watch semantics.
///
/// Writes are all-or-nothing: a returned `Ok(())` means the whole request
/// was applied. Removing an absent path succeeds.
pub trait Mailbox: Send + Sync + 'static {
    /// Set `path` to `value`, replacing anything at or beneath it.
    fn write(
        &self,
        path: &MailboxPath,
        value: MailboxValue,
    ) -> impl Future<Output = Result<(), MailboxError>> + Send;

    /// Apply several changes atomically.
    fn update(
        &self,
        changes: Vec<PathChange>,
    ) -> impl Future<Output = Result<(), MailboxError>> + Send;

    /// Remove `path` and everything beneath it.
    fn remove(&self, path: &MailboxPath) -> impl Future<Output = Result<(), MailboxError>> + Send;

    /// Read the value at `path`, `None` if absent.
    fn read_once(
        &self,
        path: &MailboxPath,
    ) -> impl Future<Output = Result<Option<MailboxValue>, MailboxError>> + Send;

    /// List the direct children of `path`, ordered by key.
    fn list(
        &self,
        path: &MailboxPath,
    ) -> impl Future<Output = Result<Vec<ChildEntry>, MailboxError>> + Send;

    /// Watch `path` and everything beneath it.
    ///
    /// The subscription delivers every change applied after this call
    /// returns. Existing values are not replayed.
    fn watch(
        &self,
        path: &MailboxPath,
    ) -> impl Future<Output = Result<Subscription, MailboxError>> + Send;

    /// Round-trip a no-op request; used as a latency probe.
    fn ping(&self) -> impl Future<Output = Result<(), MailboxError>> + Send;

    /// Transport link state, for mailboxes that hold a connection.
    ///
    /// The receiver yields `true` while the link is up. In-process mailboxes
    /// have no link and return `None`.
    fn link_state(&self) -> Option<watch::Receiver<bool>> {
        None
    }
}

/// A live watch on a mailbox path.
///
/// Dropping the subscription (or calling [`Subscription::cancel`]) detaches
/// it from the mailbox.
pub struct Subscription {
    path: MailboxPath,
    events: mpsc::UnboundedReceiver<MailboxEvent>,
    on_cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Creates a subscription fed by `events`. `on_cancel` runs once when
    /// the subscription is cancelled or dropped.
    pub fn new(
        path: MailboxPath,
        events: mpsc::UnboundedReceiver<MailboxEvent>,
        on_cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            path,
            events,
            on_cancel: Some(Box::new(on_cancel)),
        }
    }

    /// The watched path.
    #[must_use]
    pub const fn path(&self) -> &MailboxPath {
        &self.path
    }

    /// Waits for the next change. Returns `None` once the mailbox has gone
    /// away.
    pub async fn next(&mut self) -> Option<MailboxEvent> {
        self.events.recv().await
    }

    /// Returns the next change if one is already queued.
    pub fn try_next(&mut self) -> Option<MailboxEvent> {
        self.events.try_recv().ok()
    }

    /// Detaches the watch.
    pub fn cancel(mut self) {
        if let Some(on_cancel) = self.on_cancel.take() {
            on_cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(on_cancel) = self.on_cancel.take() {
            on_cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
