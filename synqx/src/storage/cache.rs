//! Per-conversation local message log.
//!
//! The [`LocalCache`] mirrors every message the client sends or receives, so
//! history stays available when the mailbox is unreachable. Each
//! conversation is one JSON array under `synqx_history_{me}_{peer}`,
//! ordered by timestamp and capped at the most recent entries.
//!
//! Storage failures never propagate: reads degrade to an empty log and
//! writes are logged and dropped, since the cache only backs up data that
//! also lives elsewhere. A log that cannot be read is never written over.
//! Entries that do not decode as messages (written by other client
//! versions) are carried through every rewrite untouched.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use synqx_proto::message::{StoredMessage, Timestamp, UserId};

use super::persistence::{Persistence, PersistenceError, load_json, store_json};

/// Default number of messages kept per conversation.
pub const DEFAULT_CACHE_CAP: usize = 200;

/// One element of a stored conversation log.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum CachedEntry {
    Message(StoredMessage),
    Foreign(serde_json::Value),
}

/// A decoded conversation log.
#[derive(Default)]
struct Conversation {
    messages: Vec<StoredMessage>,
    foreign: Vec<serde_json::Value>,
}

impl Conversation {
    fn from_entries(entries: Vec<CachedEntry>) -> Self {
        let mut conversation = Self::default();
        for entry in entries {
            match entry {
                CachedEntry::Message(message) => conversation.messages.push(message),
                CachedEntry::Foreign(value) => conversation.foreign.push(value),
            }
        }
        conversation
    }

    fn into_entries(self) -> Vec<CachedEntry> {
        self.messages
            .into_iter()
            .map(CachedEntry::Message)
            .chain(self.foreign.into_iter().map(CachedEntry::Foreign))
            .collect()
    }
}

/// Local per-conversation message log for one user.
pub struct LocalCache<P> {
    persistence: Arc<P>,
    owner: UserId,
    cap: usize,
    /// Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl<P: Persistence> LocalCache<P> {
    /// Creates a cache for `owner` keeping at most `cap` messages per
    /// conversation.
    pub fn new(persistence: Arc<P>, owner: UserId, cap: usize) -> Self {
        Self {
            persistence,
            owner,
            cap,
            write_lock: Mutex::new(()),
        }
    }

    /// Storage key of the conversation with `peer`.
    #[must_use]
    pub fn key(&self, peer: &UserId) -> String {
        format!("synqx_history_{}_{peer}", self.owner)
    }

    /// Returns the cached conversation with `peer`, oldest first.
    pub fn load(&self, peer: &UserId) -> Vec<StoredMessage> {
        match self.try_load(peer) {
            Ok(conversation) => conversation.messages,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "failed to read local history");
                Vec::new()
            }
        }
    }

    /// Inserts or replaces (by id) one message.
    pub fn upsert(&self, peer: &UserId, message: StoredMessage) {
        self.upsert_many(peer, std::iter::once(message));
    }

    /// Inserts or replaces (by id) several messages in one write.
    pub fn upsert_many(&self, peer: &UserId, messages: impl IntoIterator<Item = StoredMessage>) {
        self.modify(peer, |log| {
            for message in messages {
                upsert_sorted(log, message);
            }
            true
        });
    }

    /// Marks the message sent at `timestamp` as delivered. Returns whether a
    /// message matched.
    pub fn mark_delivered(&self, peer: &UserId, timestamp: Timestamp) -> bool {
        let mut found = false;
        self.modify(peer, |log| {
            for message in log.iter_mut().filter(|m| m.timestamp == timestamp) {
                message.delivered = true;
                found = true;
            }
            found
        });
        found
    }

    /// Removes the message with `id`. Returns whether one was removed.
    pub fn delete_by_id(&self, peer: &UserId, id: &str) -> bool {
        let mut removed = false;
        self.modify(peer, |log| {
            let before = log.len();
            log.retain(|m| m.id != id);
            removed = log.len() != before;
            removed
        });
        removed
    }

    /// Removes every message sent at `timestamp`. Returns how many were
    /// removed.
    pub fn delete_by_timestamp(&self, peer: &UserId, timestamp: Timestamp) -> usize {
        let mut removed = 0;
        self.modify(peer, |log| {
            let before = log.len();
            log.retain(|m| m.timestamp != timestamp);
            removed = before - log.len();
            removed > 0
        });
        removed
    }

    /// Drops the whole conversation with `peer`.
    pub fn clear(&self, peer: &UserId) {
        let _guard = self.write_lock.lock();
        if let Err(e) = self.persistence.remove(&self.key(peer)) {
            tracing::warn!(peer = %peer, error = %e, "failed to clear local history");
        }
    }

    fn try_load(&self, peer: &UserId) -> Result<Conversation, PersistenceError> {
        let entries: Option<Vec<CachedEntry>> = load_json(&*self.persistence, &self.key(peer))?;
        let conversation = Conversation::from_entries(entries.unwrap_or_default());
        if !conversation.foreign.is_empty() {
            tracing::debug!(peer = %peer, count = conversation.foreign.len(), "skipping unreadable history entries");
        }
        Ok(conversation)
    }

    /// Runs a read-modify-write cycle. `edit` returns whether it changed the
    /// log; unchanged logs are not written back, and neither is a log that
    /// failed to load.
    fn modify(&self, peer: &UserId, edit: impl FnOnce(&mut Vec<StoredMessage>) -> bool) {
        let _guard = self.write_lock.lock();
        let mut conversation = match self.try_load(peer) {
            Ok(conversation) => conversation,
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "local history unreadable, update dropped");
                return;
            }
        };
        let log = &mut conversation.messages;
        if !edit(log) {
            return;
        }
        if log.len() > self.cap {
            log.drain(..log.len() - self.cap);
        }
        let entries = conversation.into_entries();
        if let Err(e) = store_json(&*self.persistence, &self.key(peer), &entries) {
            tracing::warn!(peer = %peer, error = %e, "failed to write local history");
        }
    }
}

/// Replaces the entry with the same id, or inserts after the last entry
/// whose timestamp is not later than the new one.
fn upsert_sorted(log: &mut Vec<StoredMessage>, message: StoredMessage) {
    if let Some(existing) = log.iter_mut().find(|m| m.id == message.id) {
        *existing = message;
        return;
    }
    let at = log.partition_point(|m| m.timestamp <= message.timestamp);
    log.insert(at, message);
}
