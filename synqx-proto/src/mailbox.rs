//! Mailbox values and the request/response frames spoken between a client
//! and the mailbox service.
//!
//! Every client request carries a caller-chosen `id` that the service echoes
//! back in its reply. Watch notifications carry the `id` of the `watch`
//! request that created them instead.

use serde::{Deserialize, Serialize};

use crate::message::{MailboxRecord, Timestamp};
use crate::path::MailboxPath;

/// A value held at a mailbox path.
///
/// Decoding never fails for well-formed JSON: anything that is not a flag,
/// message or presence record is kept as [`MailboxValue::Other`], so one
/// foreign entry cannot spoil a whole listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MailboxValue {
    /// A boolean setting such as `chatBackup`.
    Flag(bool),
    /// A chat message.
    Message(MailboxRecord),
    /// A user's online status.
    Presence(PresenceRecord),
    /// A value this client does not understand, kept verbatim.
    Other(serde_json::Value),
}

/// Online status stored at `users/<uid>/status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    /// Whether the user has a client running.
    pub online: bool,
    /// When the status last changed.
    pub last_seen: Timestamp,
}

impl MailboxValue {
    /// Returns the message record, if this value is one.
    #[must_use]
    pub const fn as_message(&self) -> Option<&MailboxRecord> {
        match self {
            Self::Message(record) => Some(record),
            _ => None,
        }
    }

    /// Returns the flag, if this value is one.
    #[must_use]
    pub const fn as_flag(&self) -> Option<bool> {
        match self {
            Self::Flag(flag) => Some(*flag),
            _ => None,
        }
    }

    /// Consumes the value, returning the message record if it is one.
    #[must_use]
    pub fn into_message(self) -> Option<MailboxRecord> {
        match self {
            Self::Message(record) => Some(record),
            _ => None,
        }
    }

    /// Returns the presence record, if this value is one.
    #[must_use]
    pub const fn as_presence(&self) -> Option<&PresenceRecord> {
        match self {
            Self::Presence(presence) => Some(presence),
            _ => None,
        }
    }
}

impl From<PresenceRecord> for MailboxValue {
    fn from(presence: PresenceRecord) -> Self {
        Self::Presence(presence)
    }
}

impl From<MailboxRecord> for MailboxValue {
    fn from(record: MailboxRecord) -> Self {
        Self::Message(record)
    }
}

impl From<bool> for MailboxValue {
    fn from(flag: bool) -> Self {
        Self::Flag(flag)
    }
}

/// One write in a multi-path update. `None` removes the path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathChange {
    /// Target path.
    pub path: MailboxPath,
    /// New value, or `None` to remove.
    pub value: Option<MailboxValue>,
}

impl PathChange {
    /// A change that sets `path` to `value`.
    pub fn set(path: MailboxPath, value: impl Into<MailboxValue>) -> Self {
        Self {
            path,
            value: Some(value.into()),
        }
    }

    /// A change that removes `path` and everything beneath it.
    #[must_use]
    pub const fn remove(path: MailboxPath) -> Self {
        Self { path, value: None }
    }
}

/// A change observed at a single leaf path. `None` means the entry was
/// removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailboxEvent {
    /// Path of the entry that changed.
    pub path: MailboxPath,
    /// New value, or `None` if removed.
    pub value: Option<MailboxValue>,
}

impl MailboxEvent {
    /// Whether this event is a removal.
    #[must_use]
    pub const fn is_removal(&self) -> bool {
        self.value.is_none()
    }
}

/// A direct child entry returned by a `list` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildEntry {
    /// Last path segment of the child.
    pub key: String,
    /// Value held by the child.
    pub value: MailboxValue,
}

/// Frames sent from a client to the mailbox service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Set a value, replacing anything at or beneath the path.
    Write {
        /// Request id.
        id: u64,
        /// Target path.
        path: MailboxPath,
        /// Value to store.
        value: MailboxValue,
    },
    /// Apply several changes atomically.
    Update {
        /// Request id.
        id: u64,
        /// Changes, applied in order.
        changes: Vec<PathChange>,
    },
    /// Remove a path and everything beneath it.
    Remove {
        /// Request id.
        id: u64,
        /// Target path.
        path: MailboxPath,
    },
    /// Read the value at a path.
    Read {
        /// Request id.
        id: u64,
        /// Target path.
        path: MailboxPath,
    },
    /// List the direct children of a path.
    List {
        /// Request id.
        id: u64,
        /// Parent path.
        path: MailboxPath,
    },
    /// Subscribe to changes at or beneath a path.
    Watch {
        /// Request id; also identifies the subscription.
        id: u64,
        /// Watched path.
        path: MailboxPath,
    },
    /// Cancel a subscription. Not acknowledged.
    Unwatch {
        /// Id of the `watch` request to cancel.
        watch: u64,
    },
    /// Liveness check.
    Ping {
        /// Request id.
        id: u64,
    },
}

/// Frames sent from the mailbox service to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerFrame {
    /// A write, update, remove, or watch request succeeded.
    Ack {
        /// Id of the acknowledged request.
        id: u64,
    },
    /// Reply to a `read` request.
    Value {
        /// Id of the `read` request.
        id: u64,
        /// Value at the path, `None` if absent.
        value: Option<MailboxValue>,
    },
    /// Reply to a `list` request, ordered by key.
    Children {
        /// Id of the `list` request.
        id: u64,
        /// Direct children of the path.
        entries: Vec<ChildEntry>,
    },
    /// A watched entry changed.
    Changed {
        /// Id of the `watch` request.
        watch: u64,
        /// Path of the entry that changed.
        path: MailboxPath,
        /// New value, `None` if removed.
        value: Option<MailboxValue>,
    },
    /// Reply to a `ping` request.
    Pong {
        /// Id of the `ping` request.
        id: u64,
    },
    /// A request was rejected.
    Error {
        /// Id of the failed request, `None` if the frame could not be parsed.
        id: Option<u64>,
        /// Human-readable reason.
        reason: String,
    },
}

impl ServerFrame {
    /// The request id this frame answers, if it answers one.
    #[must_use]
    pub const fn request_id(&self) -> Option<u64> {
        match self {
            Self::Ack { id }
            | Self::Value { id, .. }
            | Self::Children { id, .. }
            | Self::Pong { id } => Some(*id),
            Self::Error { id, .. } => *id,
            Self::Changed { .. } => None,
        }
    }
}
