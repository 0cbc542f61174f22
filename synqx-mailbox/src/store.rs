//! In-memory keyed store with change notification.
//!
//! The [`MailboxStore`] holds every value in a single [`PathTree`]. Each
//! mutation is applied under the write lock and its leaf events are
//! broadcast before the lock is released, so all watchers observe changes in
//! the order they were applied.

use synqx_proto::mailbox::{ChildEntry, MailboxEvent, MailboxValue, PathChange};
use synqx_proto::path::{MailboxPath, PENDING_ROOT};
use synqx_proto::tree::PathTree;
use tokio::sync::{RwLock, broadcast};

/// Size limits of a [`MailboxStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    /// Entries kept per pending inbox before the oldest is evicted.
    pub max_inbox_size: usize,
    /// Changes buffered per watcher before it lags.
    pub event_capacity: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_inbox_size: 1000,
            event_capacity: 1024,
        }
    }
}

/// Thread-safe path tree with a change feed.
pub struct MailboxStore {
    tree: RwLock<PathTree>,
    events: broadcast::Sender<MailboxEvent>,
    max_inbox_size: usize,
}

impl Default for MailboxStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MailboxStore {
    /// Creates an empty store with default limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(StoreLimits::default())
    }

    /// Creates an empty store with the given limits. A zero event capacity
    /// is raised to one.
    #[must_use]
    pub fn with_limits(limits: StoreLimits) -> Self {
        let (events, _) = broadcast::channel(limits.event_capacity.max(1));
        Self {
            tree: RwLock::new(PathTree::new()),
            events,
            max_inbox_size: limits.max_inbox_size,
        }
    }

    /// Subscribes to every change applied after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<MailboxEvent> {
        self.events.subscribe()
    }

    /// Sets `path` to `value`.
    pub async fn write(&self, path: MailboxPath, value: MailboxValue) {
        self.update(vec![PathChange {
            path,
            value: Some(value),
        }])
        .await;
    }

    /// Removes `path` and everything beneath it.
    pub async fn remove(&self, path: MailboxPath) {
        self.update(vec![PathChange::remove(path)]).await;
    }

    /// Applies a batch of changes atomically, returning how many leaf events
    /// it produced.
    pub async fn update(&self, changes: Vec<PathChange>) -> usize {
        let inboxes: Vec<MailboxPath> = changes
            .iter()
            .filter(|c| c.value.is_some())
            .filter_map(|c| pending_inbox_of(&c.path))
            .collect();

        let mut tree = self.tree.write().await;
        let mut events = tree.apply(changes);
        for inbox in &inboxes {
            let evicted = tree.evict_oldest(inbox, self.max_inbox_size);
            if !evicted.is_empty() {
                tracing::info!(
                    inbox = %inbox,
                    evicted = evicted.len(),
                    "pending inbox over capacity, evicted oldest entries"
                );
            }
            events.extend(evicted);
        }
        let count = events.len();
        for event in events {
            // No receivers is fine: nobody is watching.
            let _ = self.events.send(event);
        }
        drop(tree);
        count
    }

    /// Returns the value stored at `path`.
    pub async fn read(&self, path: &MailboxPath) -> Option<MailboxValue> {
        self.tree.read().await.get(path).cloned()
    }

    /// Returns the direct children of `path`, ordered by key.
    pub async fn list(&self, path: &MailboxPath) -> Vec<ChildEntry> {
        self.tree.read().await.children(path)
    }

    /// Number of entries directly under `path`.
    pub async fn child_count(&self, path: &MailboxPath) -> usize {
        self.tree.read().await.child_count(path)
    }
}

/// The pending inbox a written entry belongs to, if it is a pending entry
/// (`pending_messages/{recipient}/{sender}/{key}`).
fn pending_inbox_of(path: &MailboxPath) -> Option<MailboxPath> {
    if path.segments().next() != Some(PENDING_ROOT) || path.segments().count() != 4 {
        return None;
    }
    path.parent()
}
