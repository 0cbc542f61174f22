//! Slash-separated mailbox paths.
//!
//! The mailbox is a tree of keyed values. Three subtrees are used:
//!
//! - `pending_messages/{recipient}/{sender}/{key}`: the recipient's inbox of
//!   undelivered messages. Entries are removed once the recipient drains them.
//! - `messages/{owner}/{peer}/{key}`: the owner's permanent copy of a
//!   conversation, written only when chat backup is enabled.
//! - `users/{uid}/settings/chatBackup`: the per-user backup preference.

use serde::{Deserialize, Serialize};

use crate::message::UserId;

/// Root segment of the pending inbox subtree.
pub const PENDING_ROOT: &str = "pending_messages";

/// Root segment of the permanent history subtree.
pub const PERMANENT_ROOT: &str = "messages";

/// Root segment of the per-user settings subtree.
pub const USERS_ROOT: &str = "users";

/// Characters that may not appear in a path segment.
const FORBIDDEN: &[char] = &['.', '#', '$', '[', ']', '/'];

/// Error returned when a path or path segment is malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    /// The path has no segments.
    #[error("path is empty")]
    Empty,
    /// A segment is empty (leading, trailing or doubled `/`).
    #[error("empty segment in path `{0}`")]
    EmptySegment(String),
    /// A segment contains a forbidden character.
    #[error("segment `{segment}` contains forbidden character {ch:?}")]
    ForbiddenChar {
        /// The offending segment.
        segment: String,
        /// The first forbidden character found.
        ch: char,
    },
}

/// A validated mailbox path such as `pending_messages/bob/alice/k1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MailboxPath(String);

impl MailboxPath {
    /// Parses and validates a slash-separated path.
    ///
    /// # Errors
    ///
    /// Returns [`PathError`] if the path is empty or any segment is empty or
    /// contains a forbidden character.
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        if raw.is_empty() {
            return Err(PathError::Empty);
        }
        for segment in raw.split('/') {
            if segment.is_empty() {
                return Err(PathError::EmptySegment(raw.to_string()));
            }
            check_segment(segment)?;
        }
        Ok(Self(raw.to_string()))
    }

    /// The recipient's pending inbox for messages from `sender`.
    ///
    /// # Errors
    ///
    /// Returns [`PathError`] if either user id is not a valid segment.
    pub fn pending_inbox(recipient: &UserId, sender: &UserId) -> Result<Self, PathError> {
        Self::from_segments(&[PENDING_ROOT, recipient.as_str(), sender.as_str()])
    }

    /// A single pending entry.
    ///
    /// # Errors
    ///
    /// Returns [`PathError`] if any segment is invalid.
    pub fn pending_entry(recipient: &UserId, sender: &UserId, key: &str) -> Result<Self, PathError> {
        Self::pending_inbox(recipient, sender)?.child(key)
    }

    /// The owner's permanent copy of the conversation with `peer`.
    ///
    /// # Errors
    ///
    /// Returns [`PathError`] if either user id is not a valid segment.
    pub fn permanent(owner: &UserId, peer: &UserId) -> Result<Self, PathError> {
        Self::from_segments(&[PERMANENT_ROOT, owner.as_str(), peer.as_str()])
    }

    /// A single permanent entry.
    ///
    /// # Errors
    ///
    /// Returns [`PathError`] if any segment is invalid.
    pub fn permanent_entry(owner: &UserId, peer: &UserId, key: &str) -> Result<Self, PathError> {
        Self::permanent(owner, peer)?.child(key)
    }

    /// The chat backup preference of `user`.
    ///
    /// # Errors
    ///
    /// Returns [`PathError`] if the user id is not a valid segment.
    pub fn backup_setting(user: &UserId) -> Result<Self, PathError> {
        Self::from_segments(&[USERS_ROOT, user.as_str(), "settings", "chatBackup"])
    }

    /// The presence record of `user`.
    ///
    /// # Errors
    ///
    /// Returns [`PathError`] if the user id is not a valid segment.
    pub fn user_status(user: &UserId) -> Result<Self, PathError> {
        Self::from_segments(&[USERS_ROOT, user.as_str(), "status"])
    }

    fn from_segments(segments: &[&str]) -> Result<Self, PathError> {
        for segment in segments {
            if segment.is_empty() {
                return Err(PathError::EmptySegment(segments.join("/")));
            }
            check_segment(segment)?;
        }
        Ok(Self(segments.join("/")))
    }

    /// Appends one segment.
    ///
    /// # Errors
    ///
    /// Returns [`PathError`] if `segment` is empty or contains a forbidden
    /// character.
    pub fn child(&self, segment: &str) -> Result<Self, PathError> {
        if segment.is_empty() {
            return Err(PathError::EmptySegment(format!("{}/", self.0)));
        }
        check_segment(segment)?;
        Ok(Self(format!("{}/{segment}", self.0)))
    }

    /// The path without its last segment, `None` for a single-segment path.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        self.0
            .rsplit_once('/')
            .map(|(parent, _)| Self(parent.to_string()))
    }

    /// The last segment (the entry key for entry paths).
    #[must_use]
    pub fn last_segment(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Iterates over the segments of this path.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Whether `other` is this path or lies beneath it.
    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        other.0 == self.0 || self.is_ancestor_of(other)
    }

    /// Whether `other` lies strictly beneath this path.
    #[must_use]
    pub fn is_ancestor_of(&self, other: &Self) -> bool {
        other
            .0
            .strip_prefix(&self.0)
            .is_some_and(|rest| rest.starts_with('/'))
    }

    /// Returns the path as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn check_segment(segment: &str) -> Result<(), PathError> {
    if let Some(ch) = segment
        .chars()
        .find(|c| FORBIDDEN.contains(c) || c.is_control())
    {
        return Err(PathError::ForbiddenChar {
            segment: segment.to_string(),
            ch,
        });
    }
    Ok(())
}

impl TryFrom<String> for MailboxPath {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<MailboxPath> for String {
    fn from(path: MailboxPath) -> Self {
        path.0
    }
}

impl std::borrow::Borrow<str> for MailboxPath {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MailboxPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
