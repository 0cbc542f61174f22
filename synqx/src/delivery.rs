//! Delivery confirmation, sender side.
//!
//! After a message lands in the recipient's pending inbox the sender waits a
//! short settle delay, then watches the exact pending entry. The entry
//! disappearing means the recipient drained it, which counts as delivered.
//! If the entry is already gone by the time the watch is in place the message
//! is delivered immediately. A safety timeout bounds every watch; when it
//! fires the outcome is unknown and the message keeps its last status.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use synqx_proto::path::MailboxPath;
use tokio::task::AbortHandle;

use crate::mailbox::Mailbox;

/// Timing of the delivery handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryConfig {
    /// Pause between the pending write and attaching the watch.
    pub settle_delay: Duration,
    /// How long a watch may wait for the removal before giving up.
    pub watch_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(300),
            watch_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// How a delivery watch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The pending entry was removed by the recipient.
    Delivered,
    /// No removal within the safety timeout. Status is left unchanged.
    TimedOut,
    /// The watch could not be attached or the mailbox went away.
    Unavailable,
}

/// Waits for the pending entry at `path` to disappear.
pub async fn await_delivery<M: Mailbox>(
    mailbox: &M,
    path: &MailboxPath,
    config: DeliveryConfig,
) -> DeliveryOutcome {
    tokio::time::sleep(config.settle_delay).await;

    // Attach before reading so a drain between the two is not missed.
    let mut subscription = match mailbox.watch(path).await {
        Ok(subscription) => subscription,
        Err(e) => {
            tracing::debug!(path = %path, error = %e, "could not watch pending entry");
            return DeliveryOutcome::Unavailable;
        }
    };

    match mailbox.read_once(path).await {
        Ok(None) => return DeliveryOutcome::Delivered,
        Ok(Some(_)) => {}
        Err(e) => {
            tracing::debug!(path = %path, error = %e, "could not read pending entry");
            return DeliveryOutcome::Unavailable;
        }
    }

    let removed = async {
        while let Some(event) = subscription.next().await {
            if event.path == *path && event.is_removal() {
                return DeliveryOutcome::Delivered;
            }
        }
        DeliveryOutcome::Unavailable
    };

    tokio::time::timeout(config.watch_timeout, removed)
        .await
        .unwrap_or(DeliveryOutcome::TimedOut)
}

/// Runs one background delivery watch per sent message.
pub struct DeliveryTracker<M> {
    mailbox: Arc<M>,
    config: DeliveryConfig,
    active: Arc<Mutex<HashMap<MailboxPath, AbortHandle>>>,
}

impl<M: Mailbox> DeliveryTracker<M> {
    /// Creates a tracker watching through `mailbox`.
    pub fn new(mailbox: Arc<M>, config: DeliveryConfig) -> Self {
        Self {
            mailbox,
            config,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The handshake timing in use.
    #[must_use]
    pub const fn config(&self) -> DeliveryConfig {
        self.config
    }

    /// Starts watching the pending entry at `path`. `on_delivered` runs once
    /// if the entry is drained; nothing runs on any other outcome.
    ///
    /// Tracking a path that is already tracked replaces the earlier watch.
    pub fn track(&self, path: MailboxPath, on_delivered: impl FnOnce() + Send + 'static) {
        let mailbox = Arc::clone(&self.mailbox);
        let active = Arc::clone(&self.active);
        let config = self.config;

        // Holding the lock across the spawn keeps the task from
        // unregistering itself before it is registered.
        let mut guard = self.active.lock();
        let task_path = path.clone();
        let handle = tokio::spawn(async move {
            let outcome = await_delivery(&*mailbox, &task_path, config).await;
            active.lock().remove(&task_path);
            match outcome {
                DeliveryOutcome::Delivered => {
                    tracing::debug!(path = %task_path, "message delivered");
                    on_delivered();
                }
                DeliveryOutcome::TimedOut => {
                    tracing::debug!(path = %task_path, "delivery watch timed out");
                }
                DeliveryOutcome::Unavailable => {
                    tracing::debug!(path = %task_path, "delivery watch unavailable");
                }
            }
        });
        if let Some(previous) = guard.insert(path, handle.abort_handle()) {
            previous.abort();
        }
    }

    /// Number of watches still running.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Stops watching `path`. Returns whether a watch was running.
    pub fn cancel(&self, path: &MailboxPath) -> bool {
        match self.active.lock().remove(path) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Stops every watch.
    pub fn cancel_all(&self) {
        for (_, handle) in self.active.lock().drain() {
            handle.abort();
        }
    }
}

impl<M> Drop for DeliveryTracker<M> {
    fn drop(&mut self) {
        for (_, handle) in self.active.lock().drain() {
            handle.abort();
        }
    }
}
