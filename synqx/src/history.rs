//! History reconciliation.
//!
//! A conversation's messages can live in three places at once: the
//! permanent mailbox path, the recipient's pending inbox, and the local
//! cache. The same logical message carries a different id in each (mailbox
//! keys versus locally assigned ids), so identity is approximated by a
//! composite [`DedupKey`] of timestamp, kind, and a content prefix.
//!
//! The key is heuristic: two distinct messages of the same kind sent in the
//! same millisecond with the same first 50 characters merge into one.

use std::collections::HashSet;

use synqx_proto::message::{MessageBody, MessageKind, StoredMessage, Timestamp};

/// Number of characters of content that take part in deduplication.
pub const CONTENT_PREFIX_CHARS: usize = 50;

/// Default number of messages returned by a history query.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Approximate identity of a message across storage locations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    timestamp: Timestamp,
    kind: MessageKind,
    content_prefix: String,
}

impl DedupKey {
    /// Derives the key of `message`.
    #[must_use]
    pub fn of(message: &StoredMessage) -> Self {
        Self {
            timestamp: message.timestamp,
            kind: message.kind(),
            content_prefix: content_prefix(&message.body),
        }
    }
}

fn content_prefix(body: &MessageBody) -> String {
    match body {
        MessageBody::Text { text } | MessageBody::System { text } => {
            text.chars().take(CONTENT_PREFIX_CHARS).collect()
        }
        MessageBody::Image { image } if image.is_empty() => "img".to_string(),
        MessageBody::Image { image } => image.chars().take(CONTENT_PREFIX_CHARS).collect(),
        MessageBody::Gif { .. } | MessageBody::Audio { .. } => String::new(),
    }
}

/// Merges message sources into one ascending, deduplicated view holding at
/// most the `limit` most recent messages.
///
/// Sources are concatenated in the order given and sorted stably, so among
/// duplicates the copy from the earliest source wins, and messages with
/// equal timestamps keep their relative input order.
#[must_use]
pub fn reconcile<I>(sources: I, limit: usize) -> Vec<StoredMessage>
where
    I: IntoIterator<Item = Vec<StoredMessage>>,
{
    let mut merged: Vec<StoredMessage> = sources.into_iter().flatten().collect();
    merged.sort_by_key(|m| m.timestamp);

    let mut seen = HashSet::with_capacity(merged.len());
    merged.retain(|m| seen.insert(DedupKey::of(m)));

    keep_last(merged, limit)
}

/// Sorts `messages` ascending by timestamp and keeps the `limit` most recent.
/// Used when only the local cache is available.
#[must_use]
pub fn sort_and_truncate(mut messages: Vec<StoredMessage>, limit: usize) -> Vec<StoredMessage> {
    messages.sort_by_key(|m| m.timestamp);
    keep_last(messages, limit)
}

fn keep_last(mut messages: Vec<StoredMessage>, limit: usize) -> Vec<StoredMessage> {
    if messages.len() > limit {
        messages.drain(..messages.len() - limit);
    }
    messages
}
