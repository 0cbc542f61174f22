//! Message routing over the mailbox store.
//!
//! [`MessageRouter`] is the send primitive used by the send queue and the
//! receive side of the delivery handshake:
//!
//! - **Send**: write the message into the recipient's pending inbox, mirror
//!   it into the local cache and, when both users keep backups, into the
//!   sender's permanent history; then start a delivery watch.
//! - **Drain**: read a pending inbox and confirm delivery by removing the
//!   entries in one batched update, copying them to permanent history when
//!   both users keep backups.
//! - **Listen**: live watches on a peer's pending and permanent paths.
//!   Messages arriving on the pending path are only confirmed while the
//!   user is viewing that conversation.
//! - **History**: merge permanent history, the pending inbox, and the local
//!   cache, falling back to the cache alone when the mailbox fails.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use synqx_proto::mailbox::{ChildEntry, MailboxValue, PathChange, PresenceRecord};
use synqx_proto::message::{
    DeliveryStatus, MailboxRecord, MessageBody, ReplyContext, StoredMessage, Timestamp, UserId,
    ValidationError, push_key,
};
use synqx_proto::path::{MailboxPath, PathError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::delivery::{DeliveryConfig, DeliveryTracker};
use crate::event::{self, ChatEvent, Direction};
use crate::history;
use crate::mailbox::{Mailbox, MailboxError, Subscription};
use crate::storage::cache::LocalCache;
use crate::storage::persistence::Persistence;

/// Errors from the send primitive and mailbox maintenance operations.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// The message body broke a per-kind rule.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// A mailbox request failed.
    #[error("mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    /// A user id cannot be used as a path segment.
    #[error("invalid path: {0}")]
    InvalidPath(#[from] PathError),
}

/// An outbound message as handed to the router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    /// Content.
    #[serde(flatten)]
    pub body: MessageBody,
    /// Creation time; also the message's identity for status updates.
    pub timestamp: Timestamp,
    /// Display name of the sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// Message being replied to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_context: Option<ReplyContext>,
}

impl OutgoingMessage {
    /// A message with no sender name or reply.
    #[must_use]
    pub const fn new(body: MessageBody, timestamp: Timestamp) -> Self {
        Self {
            body,
            timestamp,
            sender_name: None,
            reply_context: None,
        }
    }
}

/// Result of a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    /// Mailbox key of the pending entry.
    pub key: String,
    /// The message's timestamp.
    pub timestamp: Timestamp,
    /// Whether a permanent copy was written too.
    pub permanent: bool,
}

/// The network write behind the send queue.
pub trait MessageSender: Send + Sync + 'static {
    /// Delivers `message` to `recipient`'s pending inbox.
    fn send(
        &self,
        recipient: &UserId,
        message: OutgoingMessage,
    ) -> impl Future<Output = Result<SendReceipt, RouterError>> + Send;
}

/// What to delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteTarget {
    /// The entry stored under this mailbox key.
    Key(String),
    /// Every entry sent at this time.
    Timestamp(Timestamp),
}

/// Where a live listener reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Pending,
    Permanent,
}

/// Live watches for one peer. Dropping it stops both.
struct Listener {
    tasks: [JoinHandle<()>; 2],
}

impl Drop for Listener {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Routes one user's messages through a mailbox store.
pub struct MessageRouter<M, P> {
    me: UserId,
    mailbox: Arc<M>,
    cache: Arc<LocalCache<P>>,
    delivery: DeliveryTracker<M>,
    backup_enabled: AtomicBool,
    active_peer: Mutex<Option<UserId>>,
    listeners: Mutex<HashMap<UserId, Listener>>,
    events: mpsc::Sender<ChatEvent>,
}

impl<M: Mailbox, P: Persistence> MessageRouter<M, P> {
    /// Creates a router for `me`.
    pub fn new(
        me: UserId,
        mailbox: Arc<M>,
        cache: Arc<LocalCache<P>>,
        delivery: DeliveryConfig,
        events: mpsc::Sender<ChatEvent>,
    ) -> Self {
        Self {
            me,
            delivery: DeliveryTracker::new(Arc::clone(&mailbox), delivery),
            mailbox,
            cache,
            backup_enabled: AtomicBool::new(false),
            active_peer: Mutex::new(None),
            listeners: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// The local user.
    #[must_use]
    pub const fn me(&self) -> &UserId {
        &self.me
    }

    /// The local message cache.
    #[must_use]
    pub const fn cache(&self) -> &Arc<LocalCache<P>> {
        &self.cache
    }

    /// The sender-side delivery watches.
    #[must_use]
    pub const fn delivery(&self) -> &DeliveryTracker<M> {
        &self.delivery
    }

    // -----------------------------------------------------------------------
    // Backup preference
    // -----------------------------------------------------------------------

    /// Whether the local user keeps a permanent backup.
    #[must_use]
    pub fn backup_enabled(&self) -> bool {
        self.backup_enabled.load(Ordering::SeqCst)
    }

    /// Sets the local backup preference and publishes it for peers.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError`] if the preference could not be published. The
    /// local preference is updated regardless.
    pub async fn set_backup_enabled(&self, enabled: bool) -> Result<(), RouterError> {
        self.backup_enabled.store(enabled, Ordering::SeqCst);
        let path = MailboxPath::backup_setting(&self.me)?;
        self.mailbox.write(&path, MailboxValue::Flag(enabled)).await?;
        Ok(())
    }

    /// Reads whether `peer` keeps a permanent backup. An unset preference
    /// counts as off.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError`] if the preference could not be read.
    pub async fn peer_backup_enabled(&self, peer: &UserId) -> Result<bool, RouterError> {
        let path = MailboxPath::backup_setting(peer)?;
        let value = self.mailbox.read_once(&path).await?;
        Ok(value.and_then(|v| v.as_flag()).unwrap_or(false))
    }

    // -----------------------------------------------------------------------
    // Presence
    // -----------------------------------------------------------------------

    /// Publishes the local user's online status at `users/<uid>/status`.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError`] if the status could not be written.
    pub async fn update_online_status(
        &self,
        online: bool,
        last_seen: Timestamp,
    ) -> Result<(), RouterError> {
        let path = MailboxPath::user_status(&self.me)?;
        self.mailbox
            .write(&path, PresenceRecord { online, last_seen }.into())
            .await?;
        tracing::debug!(online, "online status published");
        Ok(())
    }

    /// Reads `peer`'s last published online status.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError`] if the status could not be read.
    pub async fn peer_status(&self, peer: &UserId) -> Result<Option<PresenceRecord>, RouterError> {
        let path = MailboxPath::user_status(peer)?;
        let value = self.mailbox.read_once(&path).await?;
        Ok(value.as_ref().and_then(MailboxValue::as_presence).copied())
    }

    // -----------------------------------------------------------------------
    // Send
    // -----------------------------------------------------------------------

    /// Sends `message` to `recipient`.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError`] if the message is invalid or the pending
    /// write fails. A failed permanent copy is logged, not returned, since
    /// the message has already been delivered to the pending inbox.
    pub async fn send_message(
        &self,
        recipient: &UserId,
        message: OutgoingMessage,
    ) -> Result<SendReceipt, RouterError> {
        message.body.validate()?;

        let permanent = self.backup_enabled() && self.peer_backup_enabled(recipient).await?;

        let record = MailboxRecord {
            body: message.body,
            timestamp: message.timestamp,
            sender: self.me.clone(),
            sender_name: message.sender_name,
            read: false,
            delivered: false,
            reply_context: message.reply_context,
        };
        let key = push_key();
        let pending = MailboxPath::pending_entry(recipient, &self.me, &key)?;
        self.mailbox
            .write(&pending, MailboxValue::Message(record.clone()))
            .await?;
        tracing::debug!(key = %key, recipient = %recipient, kind = %record.body.kind(), "pending message written");

        self.cache.upsert(
            recipient,
            StoredMessage::from_record(key.clone(), recipient.clone(), record.clone()),
        );

        if permanent {
            let path = MailboxPath::permanent_entry(&self.me, recipient, &key)?;
            if let Err(e) = self.mailbox.write(&path, MailboxValue::Message(record)).await {
                tracing::warn!(key = %key, error = %e, "failed to write permanent copy");
            }
        }

        let timestamp = message.timestamp;
        let cache = Arc::clone(&self.cache);
        let events = self.events.clone();
        let peer = recipient.clone();
        self.delivery.track(pending, move || {
            cache.mark_delivered(&peer, timestamp);
            event::emit(
                &events,
                ChatEvent::StatusChanged {
                    timestamp,
                    status: DeliveryStatus::Delivered,
                },
            );
        });

        Ok(SendReceipt {
            key,
            timestamp,
            permanent,
        })
    }

    // -----------------------------------------------------------------------
    // Drain and confirm
    // -----------------------------------------------------------------------

    /// Reads every message `peer` left in the local user's pending inbox and
    /// confirms their delivery. Returns the messages read; failures are
    /// logged and yield an empty list.
    pub async fn fetch_pending(&self, peer: &UserId) -> Vec<StoredMessage> {
        let messages = match self.list_pending(peer).await {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "failed to fetch pending messages");
                return Vec::new();
            }
        };
        if !messages.is_empty() {
            tracing::info!(peer = %peer, count = messages.len(), "draining pending messages");
            self.confirm_delivery(peer, &messages).await;
        }
        messages
    }

    /// Confirms delivery of `messages` received from `peer`: removes them
    /// from the pending inbox in one update, copies them to permanent
    /// history when both users keep backups, and always caches them as
    /// delivered. Returns whether the mailbox update succeeded.
    pub async fn confirm_delivery(&self, peer: &UserId, messages: &[StoredMessage]) -> bool {
        let permanent = self.backup_enabled()
            && match self.peer_backup_enabled(peer).await {
                Ok(enabled) => enabled,
                Err(e) => {
                    tracing::debug!(peer = %peer, error = %e, "peer backup preference unknown");
                    false
                }
            };

        let delivered: Vec<StoredMessage> = messages
            .iter()
            .cloned()
            .map(|mut m| {
                m.delivered = true;
                m
            })
            .collect();

        let changes = match self.confirmation_changes(peer, &delivered, permanent) {
            Ok(changes) => changes,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "cannot confirm delivery");
                return false;
            }
        };

        self.cache.upsert_many(peer, delivered);

        match self.mailbox.update(changes).await {
            Ok(()) => {
                tracing::debug!(peer = %peer, count = messages.len(), permanent, "delivery confirmed");
                true
            }
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "failed to confirm delivery");
                false
            }
        }
    }

    fn confirmation_changes(
        &self,
        peer: &UserId,
        delivered: &[StoredMessage],
        permanent: bool,
    ) -> Result<Vec<PathChange>, PathError> {
        let mut changes = Vec::with_capacity(delivered.len() * 2);
        for message in delivered {
            changes.push(PathChange::remove(MailboxPath::pending_entry(
                &self.me,
                peer,
                &message.id,
            )?));
            if permanent {
                changes.push(PathChange::set(
                    MailboxPath::permanent_entry(&self.me, peer, &message.id)?,
                    message.to_record(),
                ));
            }
        }
        Ok(changes)
    }

    async fn list_pending(&self, peer: &UserId) -> Result<Vec<StoredMessage>, MailboxError> {
        let inbox = MailboxPath::pending_inbox(&self.me, peer)?;
        let entries = self.mailbox.list(&inbox).await?;
        Ok(self.resolve(peer, entries))
    }

    /// Turns mailbox entries of the conversation with `peer` into stored
    /// messages, skipping anything that is not a message.
    fn resolve(&self, peer: &UserId, entries: Vec<ChildEntry>) -> Vec<StoredMessage> {
        entries
            .into_iter()
            .filter_map(|entry| {
                let Some(record) = entry.value.into_message() else {
                    tracing::debug!(peer = %peer, key = %entry.key, "skipping non-message entry");
                    return None;
                };
                Some(self.stored(peer, entry.key, record))
            })
            .collect()
    }

    fn stored(&self, peer: &UserId, key: String, record: MailboxRecord) -> StoredMessage {
        let recipient = if record.sender == self.me {
            peer.clone()
        } else {
            self.me.clone()
        };
        StoredMessage::from_record(key, recipient, record)
    }

    // -----------------------------------------------------------------------
    // Live listeners
    // -----------------------------------------------------------------------

    /// Marks the conversation the user is looking at. Messages from any
    /// other peer are received but not confirmed.
    pub fn set_active_peer(&self, peer: Option<UserId>) {
        *self.active_peer.lock() = peer;
    }

    /// Whether the user is currently viewing the conversation with `peer`.
    #[must_use]
    pub fn is_viewing(&self, peer: &UserId) -> bool {
        self.active_peer.lock().as_ref() == Some(peer)
    }

    /// Starts live listeners on the pending inbox and permanent history of
    /// the conversation with `peer`, replacing any earlier listeners for
    /// that peer. Only changes made after this call are surfaced.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError`] if either watch cannot be attached.
    pub async fn listen_for_messages(self: &Arc<Self>, peer: &UserId) -> Result<(), RouterError> {
        self.detach_listener(peer);

        let pending = self
            .mailbox
            .watch(&MailboxPath::pending_inbox(&self.me, peer)?)
            .await?;
        let permanent = self
            .mailbox
            .watch(&MailboxPath::permanent(&self.me, peer)?)
            .await?;

        let seen = Arc::new(Mutex::new(HashSet::new()));
        let tasks = [
            tokio::spawn(run_listener(
                Arc::downgrade(self),
                peer.clone(),
                Source::Pending,
                pending,
                Arc::clone(&seen),
            )),
            tokio::spawn(run_listener(
                Arc::downgrade(self),
                peer.clone(),
                Source::Permanent,
                permanent,
                seen,
            )),
        ];
        self.listeners.lock().insert(peer.clone(), Listener { tasks });
        tracing::info!(peer = %peer, "listening for messages");
        Ok(())
    }

    /// Stops the listeners for `peer`. Returns whether any were running.
    pub fn detach_listener(&self, peer: &UserId) -> bool {
        let removed = self.listeners.lock().remove(peer).is_some();
        if removed {
            tracing::debug!(peer = %peer, "listener detached");
        }
        removed
    }

    /// Stops every listener.
    pub fn detach_all(&self) {
        self.listeners.lock().clear();
    }

    /// Number of peers with live listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    async fn receive(&self, peer: &UserId, source: Source, message: StoredMessage) {
        tracing::debug!(key = %message.id, peer = %peer, ?source, "message received");
        self.cache.upsert(peer, message.clone());
        event::emit(
            &self.events,
            ChatEvent::MessageRendered {
                message: message.clone(),
                direction: Direction::Received,
            },
        );
        if source == Source::Pending {
            if self.is_viewing(peer) {
                self.confirm_delivery(peer, std::slice::from_ref(&message))
                    .await;
            } else {
                tracing::debug!(peer = %peer, "not viewing conversation, delivery left unconfirmed");
            }
        }
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    /// Returns the `limit` most recent messages with `peer`, merged from
    /// permanent history, the pending inbox, and the local cache. Falls back
    /// to the local cache alone if the mailbox cannot be read.
    pub async fn get_history(&self, peer: &UserId, limit: usize) -> Vec<StoredMessage> {
        let local = self.cache.load(peer);
        match self.fetch_remote(peer).await {
            Ok((permanent, pending)) => history::reconcile([permanent, pending, local], limit),
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "history fetch failed, using local cache");
                history::sort_and_truncate(local, limit)
            }
        }
    }

    async fn fetch_remote(
        &self,
        peer: &UserId,
    ) -> Result<(Vec<StoredMessage>, Vec<StoredMessage>), MailboxError> {
        let permanent_path = MailboxPath::permanent(&self.me, peer)?;
        let pending_path = MailboxPath::pending_inbox(&self.me, peer)?;
        let (permanent, pending) = tokio::try_join!(
            self.mailbox.list(&permanent_path),
            self.mailbox.list(&pending_path),
        )?;
        Ok((self.resolve(peer, permanent), self.resolve(peer, pending)))
    }

    // -----------------------------------------------------------------------
    // Deletion
    // -----------------------------------------------------------------------

    /// Deletes a message from the local user's permanent history, pending
    /// inbox, and local cache. With `for_everyone`, entries sent at the same
    /// time are also removed from the peer's paths. Returns the number of
    /// mailbox entries removed; deleting an absent message removes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError`] if the mailbox cannot be read or updated.
    pub async fn delete_message(
        &self,
        peer: &UserId,
        target: DeleteTarget,
        for_everyone: bool,
    ) -> Result<usize, RouterError> {
        let own = [
            MailboxPath::permanent(&self.me, peer)?,
            MailboxPath::pending_inbox(&self.me, peer)?,
        ];

        let mut doomed = Vec::new();
        let timestamp = match &target {
            DeleteTarget::Key(key) => {
                let mut timestamp = None;
                for parent in &own {
                    let path = parent.child(key)?;
                    if let Some(value) = self.mailbox.read_once(&path).await? {
                        if let Some(record) = value.as_message() {
                            timestamp.get_or_insert(record.timestamp);
                        }
                        doomed.push(path);
                    }
                }
                timestamp.or_else(|| {
                    self.cache
                        .load(peer)
                        .into_iter()
                        .find(|m| &m.id == key)
                        .map(|m| m.timestamp)
                })
            }
            DeleteTarget::Timestamp(timestamp) => {
                for parent in &own {
                    doomed.extend(self.entries_at(parent, *timestamp).await?);
                }
                Some(*timestamp)
            }
        };

        if for_everyone && let Some(timestamp) = timestamp {
            for parent in [
                MailboxPath::permanent(peer, &self.me)?,
                MailboxPath::pending_inbox(peer, &self.me)?,
            ] {
                doomed.extend(self.entries_at(&parent, timestamp).await?);
            }
        }

        let removed = doomed.len();
        if removed > 0 {
            self.mailbox
                .update(doomed.into_iter().map(PathChange::remove).collect())
                .await?;
        }

        if let DeleteTarget::Key(key) = &target {
            self.cache.delete_by_id(peer, key);
        }
        if let Some(timestamp) = timestamp {
            self.cache.delete_by_timestamp(peer, timestamp);
        }

        tracing::info!(peer = %peer, removed, for_everyone, "message deleted");
        Ok(removed)
    }

    async fn entries_at(
        &self,
        parent: &MailboxPath,
        timestamp: Timestamp,
    ) -> Result<Vec<MailboxPath>, RouterError> {
        let mut paths = Vec::new();
        for entry in self.mailbox.list(parent).await? {
            if entry.value.as_message().is_some_and(|r| r.timestamp == timestamp) {
                paths.push(parent.child(&entry.key)?);
            }
        }
        Ok(paths)
    }

    /// Clears the conversation with `peer`: permanent history in both
    /// directions, the local user's pending inbox from `peer`, and the local
    /// cache.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError`] if the mailbox update fails. The local cache
    /// is cleared regardless.
    pub async fn clear_conversation(&self, peer: &UserId) -> Result<(), RouterError> {
        self.cache.clear(peer);
        let changes = vec![
            PathChange::remove(MailboxPath::permanent(&self.me, peer)?),
            PathChange::remove(MailboxPath::permanent(peer, &self.me)?),
            PathChange::remove(MailboxPath::pending_inbox(&self.me, peer)?),
        ];
        self.mailbox.update(changes).await?;
        tracing::info!(peer = %peer, "conversation cleared");
        Ok(())
    }
}

impl<M: Mailbox, P: Persistence> MessageSender for MessageRouter<M, P> {
    async fn send(
        &self,
        recipient: &UserId,
        message: OutgoingMessage,
    ) -> Result<SendReceipt, RouterError> {
        self.send_message(recipient, message).await
    }
}

impl<M, P> Drop for MessageRouter<M, P> {
    fn drop(&mut self) {
        self.listeners.lock().clear();
    }
}

/// Surfaces new messages from one watched path. Holds only a weak reference
/// so a dropped router ends the task.
async fn run_listener<M: Mailbox, P: Persistence>(
    router: Weak<MessageRouter<M, P>>,
    peer: UserId,
    source: Source,
    mut subscription: Subscription,
    seen: Arc<Mutex<HashSet<String>>>,
) {
    let parent = subscription.path().clone();
    while let Some(event) = subscription.next().await {
        if event.path.parent().as_ref() != Some(&parent) {
            continue;
        }
        let Some(record) = event.value.and_then(MailboxValue::into_message) else {
            continue;
        };
        let Some(router) = router.upgrade() else {
            break;
        };
        // Own messages copied into permanent history are already shown.
        if source == Source::Permanent && record.sender == router.me {
            continue;
        }
        let key = event.path.last_segment().to_string();
        if !seen.lock().insert(key.clone()) {
            continue;
        }
        let message = router.stored(&peer, key, record);
        router.receive(&peer, source, message).await;
    }
}
