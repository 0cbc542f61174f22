//! In-process mailbox for tests and offline simulation.
//!
//! A [`MemoryMailbox`] is cheap to clone; clones share one store, so two
//! simulated users holding clones see each other's writes and watches exactly
//! as they would through the mailbox service. Fault injection knobs make the
//! store unreachable, reject the next N writes, or delay every request.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use synqx_proto::mailbox::{ChildEntry, MailboxEvent, MailboxValue, PathChange};
use synqx_proto::path::MailboxPath;
use synqx_proto::tree::PathTree;
use tokio::sync::mpsc;

use super::{Mailbox, MailboxError, Subscription};

struct Watcher {
    id: u64,
    path: MailboxPath,
    tx: mpsc::UnboundedSender<MailboxEvent>,
}

#[derive(Default)]
struct State {
    tree: PathTree,
    watchers: Vec<Watcher>,
    next_watch: u64,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    unreachable: AtomicBool,
    failing_writes: AtomicU32,
    latency_ms: AtomicU64,
    write_attempts: AtomicU64,
}

/// Shared in-process mailbox store.
#[derive(Clone, Default)]
pub struct MemoryMailbox {
    inner: Arc<Inner>,
}

impl MemoryMailbox {
    /// Creates an empty, reachable mailbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every request fail with [`MailboxError::Unreachable`] until
    /// reset.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Rejects the next `count` write, update, or remove requests.
    pub fn fail_next_writes(&self, count: u32) {
        self.inner.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Delays every request by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.inner.latency_ms.store(millis, Ordering::SeqCst);
    }

    /// Number of write, update, and remove requests received, including
    /// rejected ones.
    #[must_use]
    pub fn write_attempts(&self) -> u64 {
        self.inner.write_attempts.load(Ordering::SeqCst)
    }

    /// Returns the value stored at `path` without going through the
    /// request path (no latency, no fault injection).
    #[must_use]
    pub fn get(&self, path: &MailboxPath) -> Option<MailboxValue> {
        self.inner.state.lock().tree.get(path).cloned()
    }

    /// Whether a value is stored at `path`.
    #[must_use]
    pub fn contains(&self, path: &MailboxPath) -> bool {
        self.get(path).is_some()
    }

    /// Direct children of `path`, bypassing fault injection.
    #[must_use]
    pub fn children(&self, path: &MailboxPath) -> Vec<ChildEntry> {
        self.inner.state.lock().tree.children(path)
    }

    /// Number of live watches.
    #[must_use]
    pub fn watcher_count(&self) -> usize {
        self.inner.state.lock().watchers.len()
    }

    async fn gate(&self) -> Result<(), MailboxError> {
        let latency = self.inner.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.inner.unreachable.load(Ordering::SeqCst) {
            return Err(MailboxError::Unreachable("memory mailbox offline".into()));
        }
        Ok(())
    }

    async fn gate_write(&self) -> Result<(), MailboxError> {
        self.inner.write_attempts.fetch_add(1, Ordering::SeqCst);
        self.gate().await?;
        let injected = self
            .inner
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(MailboxError::Rejected("injected write failure".into()));
        }
        Ok(())
    }

    fn apply(&self, changes: Vec<PathChange>) {
        let mut state = self.inner.state.lock();
        let events = state.tree.apply(changes);
        publish(&mut state.watchers, &events);
    }
}

/// Fans events out to matching watchers, dropping watchers whose receiver
/// is gone.
fn publish(watchers: &mut Vec<Watcher>, events: &[MailboxEvent]) {
    for event in events {
        watchers.retain(|w| !w.path.contains(&event.path) || w.tx.send(event.clone()).is_ok());
    }
}

fn detach(inner: &Weak<Inner>, id: u64) {
    if let Some(inner) = inner.upgrade() {
        inner.state.lock().watchers.retain(|w| w.id != id);
    }
}

impl Mailbox for MemoryMailbox {
    async fn write(&self, path: &MailboxPath, value: MailboxValue) -> Result<(), MailboxError> {
        self.gate_write().await?;
        self.apply(vec![PathChange {
            path: path.clone(),
            value: Some(value),
        }]);
        Ok(())
    }

    async fn update(&self, changes: Vec<PathChange>) -> Result<(), MailboxError> {
        self.gate_write().await?;
        self.apply(changes);
        Ok(())
    }

    async fn remove(&self, path: &MailboxPath) -> Result<(), MailboxError> {
        self.gate_write().await?;
        self.apply(vec![PathChange::remove(path.clone())]);
        Ok(())
    }

    async fn read_once(&self, path: &MailboxPath) -> Result<Option<MailboxValue>, MailboxError> {
        self.gate().await?;
        Ok(self.get(path))
    }

    async fn list(&self, path: &MailboxPath) -> Result<Vec<ChildEntry>, MailboxError> {
        self.gate().await?;
        Ok(self.children(path))
    }

    async fn watch(&self, path: &MailboxPath) -> Result<Subscription, MailboxError> {
        self.gate().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.inner.state.lock();
            state.next_watch += 1;
            let id = state.next_watch;
            state.watchers.push(Watcher {
                id,
                path: path.clone(),
                tx,
            });
            id
        };
        let weak = Arc::downgrade(&self.inner);
        Ok(Subscription::new(path.clone(), rx, move || {
            detach(&weak, id);
        }))
    }

    async fn ping(&self) -> Result<(), MailboxError> {
        self.gate().await
    }
}
