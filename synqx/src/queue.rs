//! Send queue and retry engine.
//!
//! Every outbound message becomes a [`QueuedMessage`] that is rendered
//! optimistically, persisted, and handed to a single-flight processing loop.
//! The loop runs while the connection is online, sends the head of the
//! queue with a quality-dependent timeout, and on failure backs off and
//! requeues the item at the tail until its retry budget is spent. Items that
//! exhaust the budget move to a failed set and wait for a manual retry.
//!
//! The active queue and the failed set are persisted together after every
//! processing pass; [`SendQueue::restore`] reloads whatever is younger than
//! the restore window.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use synqx_proto::message::{DeliveryStatus, StoredMessage, Timestamp, UserId};
use tokio::sync::{mpsc, watch};

use crate::clock::Clock;
use crate::connection::{ConnectionQuality, ConnectionState};
use crate::event::{self, ChatEvent, Direction};
use crate::router::{MessageSender, OutgoingMessage, RouterError, SendReceipt};
use crate::storage::persistence::{Persistence, load_json, store_json};

/// Storage key of the persisted queue.
pub const PENDING_STORAGE_KEY: &str = "synqx_pending_messages";

const ID_SUFFIX_LEN: usize = 9;
const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Locally generated identifier of a queued message: `msg_<millis>_<suffix>`
/// with a nine-character base-36 random suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueuedId(String);

impl QueuedId {
    /// Generates an id for a message created at `now`.
    #[must_use]
    pub fn generate(now: Timestamp) -> Self {
        let mut rng = rand::rng();
        let suffix: String = (0..ID_SUFFIX_LEN)
            .map(|_| char::from(BASE36[rng.random_range(0..BASE36.len())]))
            .collect();
        Self(format!("msg_{}_{suffix}", now.as_millis()))
    }

    /// Wraps an existing id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueuedId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One outbound send attempt, from submission to success or failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    /// Local identifier.
    pub id: QueuedId,
    /// Who the message is for.
    pub recipient_id: UserId,
    /// What to send.
    pub message: OutgoingMessage,
    /// Current status.
    pub status: DeliveryStatus,
    /// Failed attempts so far.
    pub retries: u32,
    /// When the message was submitted.
    pub created_at: Timestamp,
}

/// Retry budget, backoff, and timeouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Attempts before an item is marked failed.
    pub max_retries: u32,
    /// Backoff after the n-th failure; the last entry repeats.
    pub retry_delays: Vec<Duration>,
    /// Send deadline on a good connection.
    pub send_timeout: Duration,
    /// Send deadline on a degraded connection.
    pub slow_send_timeout: Duration,
    /// Persisted items older than this are dropped on restore.
    pub restore_window: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delays: [1, 2, 5, 10, 30].map(Duration::from_secs).to_vec(),
            send_timeout: Duration::from_secs(15),
            slow_send_timeout: Duration::from_secs(30),
            restore_window: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl QueueConfig {
    /// Backoff to sleep after a failure when `retries` failures had already
    /// been counted.
    #[must_use]
    pub fn retry_delay(&self, retries: u32) -> Duration {
        let index = usize::try_from(retries).unwrap_or(usize::MAX);
        self.retry_delays
            .get(index)
            .or_else(|| self.retry_delays.last())
            .copied()
            .unwrap_or_default()
    }

    /// Send deadline for the given connection quality.
    #[must_use]
    pub const fn send_timeout_for(&self, quality: ConnectionQuality) -> Duration {
        match quality {
            ConnectionQuality::Good => self.send_timeout,
            ConnectionQuality::Slow | ConnectionQuality::Offline => self.slow_send_timeout,
        }
    }
}

/// Why a single send attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The send did not complete before the deadline.
    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    /// The router rejected or could not complete the send.
    #[error("send failed: {0}")]
    Router(#[from] RouterError),
}

impl SendError {
    /// Whether retrying cannot help: the message itself or its recipient
    /// is unusable.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Router(RouterError::Validation(_) | RouterError::InvalidPath(_))
        )
    }
}

#[derive(Default)]
struct QueueState {
    /// Waiting items, head first. The head stays here while it is in flight.
    active: VecDeque<QueuedMessage>,
    /// The head currently being sent, if any.
    in_flight: Option<QueuedId>,
    /// Items that exhausted their retry budget.
    failed: Vec<QueuedMessage>,
}

struct Inner<S, P, C> {
    me: UserId,
    sender: Arc<S>,
    persistence: Arc<P>,
    clock: Arc<C>,
    config: QueueConfig,
    state: Mutex<QueueState>,
    processing: AtomicBool,
    connection: watch::Receiver<ConnectionState>,
    events: mpsc::Sender<ChatEvent>,
}

/// The outbound message queue. Cheap to clone; clones share one queue.
pub struct SendQueue<S, P, C> {
    inner: Arc<Inner<S, P, C>>,
}

impl<S, P, C> Clone for SendQueue<S, P, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: MessageSender, P: Persistence, C: Clock> SendQueue<S, P, C> {
    /// Creates an empty queue.
    pub fn new(
        me: UserId,
        sender: Arc<S>,
        persistence: Arc<P>,
        clock: Arc<C>,
        config: QueueConfig,
        connection: watch::Receiver<ConnectionState>,
        events: mpsc::Sender<ChatEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                me,
                sender,
                persistence,
                clock,
                config,
                state: Mutex::new(QueueState::default()),
                processing: AtomicBool::new(false),
                connection,
                events,
            }),
        }
    }

    /// The retry configuration in use.
    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Queues `message` for `recipient`, renders it optimistically, and
    /// starts processing if a runtime is available. Never fails; the outcome
    /// is reported through status events.
    pub fn enqueue(&self, recipient: UserId, message: OutgoingMessage) -> QueuedId {
        let now = self.inner.clock.now();
        let item = QueuedMessage {
            id: QueuedId::generate(now),
            recipient_id: recipient,
            message,
            status: DeliveryStatus::Sending,
            retries: 0,
            created_at: now,
        };
        let id = item.id.clone();

        self.emit(ChatEvent::MessageRendered {
            message: self.optimistic(&item),
            direction: Direction::Sent,
        });
        self.emit_status(&item, DeliveryStatus::Sending);
        tracing::debug!(id = %id, recipient = %item.recipient_id, "message queued");

        self.inner.state.lock().active.push_back(item);
        self.persist();
        self.kick();
        id
    }

    /// Requeues a failed message with a fresh retry budget. Returns `false`
    /// if `id` is not a failed message.
    pub fn retry_message(&self, id: &QueuedId) -> bool {
        let item = {
            let mut state = self.inner.state.lock();
            let Some(pos) = state.failed.iter().position(|m| &m.id == id) else {
                return false;
            };
            let mut item = state.failed.remove(pos);
            item.retries = 0;
            item.status = DeliveryStatus::Sending;
            state.active.push_back(item.clone());
            item
        };
        tracing::info!(id = %id, "retrying failed message");
        self.emit_status(&item, DeliveryStatus::Sending);
        self.persist();
        self.kick();
        true
    }

    /// Removes a message that is not currently being sent. Returns whether
    /// it was removed.
    pub fn cancel(&self, id: &QueuedId) -> bool {
        let removed = {
            let mut state = self.inner.state.lock();
            if state.in_flight.as_ref() == Some(id) {
                false
            } else if let Some(pos) = state.active.iter().position(|m| &m.id == id) {
                state.active.remove(pos).is_some()
            } else if let Some(pos) = state.failed.iter().position(|m| &m.id == id) {
                state.failed.remove(pos);
                true
            } else {
                false
            }
        };
        if removed {
            tracing::debug!(id = %id, "queued message cancelled");
            self.persist();
        }
        removed
    }

    /// Sets the displayed status of a queued or failed message and persists
    /// it. Queue membership is unchanged. Returns `false` for unknown ids.
    pub fn update_message_status(&self, id: &QueuedId, status: DeliveryStatus) -> bool {
        let item = {
            let mut state = self.inner.state.lock();
            let QueueState { active, failed, .. } = &mut *state;
            let Some(item) = active.iter_mut().chain(failed.iter_mut()).find(|m| &m.id == id)
            else {
                return false;
            };
            item.status = status;
            item.clone()
        };
        self.emit_status(&item, status);
        self.persist();
        true
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// Messages waiting to be sent, including the one in flight.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().active.len()
    }

    /// Snapshot of the active queue, head first.
    #[must_use]
    pub fn pending(&self) -> Vec<QueuedMessage> {
        self.inner.state.lock().active.iter().cloned().collect()
    }

    /// Snapshot of the failed set.
    #[must_use]
    pub fn failed(&self) -> Vec<QueuedMessage> {
        self.inner.state.lock().failed.clone()
    }

    /// Whether the processing loop is running.
    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.inner.processing.load(Ordering::SeqCst)
    }

    fn is_online(&self) -> bool {
        self.inner.connection.borrow().online
    }

    fn quality(&self) -> ConnectionQuality {
        self.inner.connection.borrow().quality
    }

    // -----------------------------------------------------------------------
    // Processing
    // -----------------------------------------------------------------------

    /// Runs the processing loop until the queue is empty or the connection
    /// drops. Returns immediately if another loop is already running.
    pub async fn process_queue(&self) {
        loop {
            if self
                .inner
                .processing
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }
            self.drain().await;
            self.persist();
            self.inner.processing.store(false, Ordering::SeqCst);

            // An enqueue that raced with the end of the pass saw the flag
            // still set and did not start a loop of its own.
            if !self.is_online() || self.pending_count() == 0 {
                return;
            }
        }
    }

    async fn drain(&self) {
        while self.is_online() {
            let Some(mut item) = self.begin_attempt() else {
                break;
            };
            let result = self.send_with_retry(&mut item).await;
            self.finish_attempt(item, result);
        }
    }

    fn begin_attempt(&self) -> Option<QueuedMessage> {
        let mut state = self.inner.state.lock();
        let item = state.active.front().cloned()?;
        state.in_flight = Some(item.id.clone());
        Some(item)
    }

    fn finish_attempt(&self, mut item: QueuedMessage, result: Result<SendReceipt, SendError>) {
        let outcome = {
            let mut state = self.inner.state.lock();
            state.in_flight = None;
            if state.active.front().is_some_and(|m| m.id == item.id) {
                state.active.pop_front();
            }
            match &result {
                Ok(_) => DeliveryStatus::Sent,
                Err(e) if !e.is_permanent() && item.retries < self.inner.config.max_retries => {
                    state.active.push_back(item.clone());
                    DeliveryStatus::Sending
                }
                Err(_) => {
                    item.status = DeliveryStatus::Failed;
                    state.failed.push(item.clone());
                    DeliveryStatus::Failed
                }
            }
        };

        match (outcome, result) {
            (DeliveryStatus::Sent, Ok(receipt)) => {
                tracing::info!(id = %item.id, key = %receipt.key, permanent = receipt.permanent, "message sent");
                self.emit_status(&item, DeliveryStatus::Sent);
            }
            (DeliveryStatus::Failed, Err(e)) if e.is_permanent() => {
                tracing::warn!(id = %item.id, error = %e, "message failed, not retryable");
                self.emit_status(&item, DeliveryStatus::Failed);
            }
            (DeliveryStatus::Failed, _) => {
                tracing::warn!(id = %item.id, retries = item.retries, "message failed, retry budget exhausted");
                self.emit_status(&item, DeliveryStatus::Failed);
            }
            _ => {}
        }
    }

    /// Makes one send attempt for `item` under the quality-dependent
    /// deadline. On failure the item's retry count is incremented and, unless
    /// the budget is now spent, the backoff is slept before returning.
    async fn send_with_retry(&self, item: &mut QueuedMessage) -> Result<SendReceipt, SendError> {
        let delay = self.inner.config.retry_delay(item.retries);
        let timeout = self.inner.config.send_timeout_for(self.quality());

        let attempt = self.inner.sender.send(&item.recipient_id, item.message.clone());
        let error = match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(receipt)) => return Ok(receipt),
            Ok(Err(e)) => SendError::Router(e),
            Err(_) => SendError::Timeout(timeout),
        };

        item.retries += 1;
        tracing::warn!(
            id = %item.id,
            attempt = item.retries,
            max_retries = self.inner.config.max_retries,
            error = %error,
            "send attempt failed"
        );
        if !error.is_permanent() && item.retries < self.inner.config.max_retries {
            tokio::time::sleep(delay).await;
        }
        Err(error)
    }

    /// Starts a processing loop on the current runtime, if there is one.
    fn kick(&self) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let queue = self.clone();
                handle.spawn(async move { queue.process_queue().await });
            }
            Err(_) => tracing::debug!("no runtime, queue processing deferred"),
        }
    }

    /// Spawns a task that restarts processing whenever the connection comes
    /// back online.
    pub fn spawn_resume_on_reconnect(&self) -> tokio::task::JoinHandle<()> {
        let queue = self.clone();
        let mut connection = self.inner.connection.clone();
        let mut was_online = connection.borrow_and_update().online;
        tokio::spawn(async move {
            while connection.changed().await.is_ok() {
                let online = connection.borrow_and_update().online;
                if online && !was_online {
                    tracing::info!(pending = queue.pending_count(), "back online, resuming queue");
                    queue.process_queue().await;
                }
                was_online = online;
            }
        })
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Writes the active queue and the failed set to storage. Failures are
    /// logged.
    pub fn persist(&self) {
        let items: Vec<QueuedMessage> = {
            let state = self.inner.state.lock();
            state.active.iter().chain(state.failed.iter()).cloned().collect()
        };
        if let Err(e) = store_json(&*self.inner.persistence, PENDING_STORAGE_KEY, &items) {
            tracing::warn!(error = %e, "failed to persist send queue");
        }
    }

    /// Loads persisted items younger than the restore window, adding active
    /// ones to the queue and failed ones to the failed set. Returns how many
    /// were restored. Does not start processing.
    pub fn restore(&self) -> usize {
        let items: Vec<QueuedMessage> =
            match load_json(&*self.inner.persistence, PENDING_STORAGE_KEY) {
                Ok(items) => items.unwrap_or_default(),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to load persisted send queue");
                    return 0;
                }
            };

        let now = self.inner.clock.now();
        let window = self.inner.config.restore_window;
        let total = items.len();
        let mut restored = 0;
        {
            let mut state = self.inner.state.lock();
            for mut item in items {
                if now.since(item.created_at) >= window {
                    continue;
                }
                let known = state
                    .active
                    .iter()
                    .chain(state.failed.iter())
                    .any(|m| m.id == item.id);
                if known {
                    continue;
                }
                if item.status == DeliveryStatus::Failed {
                    state.failed.push(item);
                } else {
                    item.status = DeliveryStatus::Sending;
                    state.active.push_back(item);
                }
                restored += 1;
            }
        }
        tracing::info!(restored, expired = total - restored, "send queue restored");
        restored
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    fn optimistic(&self, item: &QueuedMessage) -> StoredMessage {
        StoredMessage {
            id: item.id.to_string(),
            sender_id: self.inner.me.clone(),
            recipient_id: item.recipient_id.clone(),
            body: item.message.body.clone(),
            timestamp: item.message.timestamp,
            delivered: false,
            read: false,
            sender_name: item.message.sender_name.clone(),
            reply_context: item.message.reply_context.clone(),
        }
    }

    fn emit_status(&self, item: &QueuedMessage, status: DeliveryStatus) {
        self.emit(ChatEvent::StatusChanged {
            timestamp: item.message.timestamp,
            status,
        });
    }

    fn emit(&self, event: ChatEvent) {
        event::emit(&self.inner.events, event);
    }
}
