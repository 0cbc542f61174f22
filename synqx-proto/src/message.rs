//! Message types shared by the client core and the mailbox service.
//!
//! [`MailboxRecord`] is the value stored under a mailbox path. Its JSON form is
//! the legacy shape `{type, text|image|content|audio, timestamp, sender, read,
//! delivered}` and must stay readable by clients that wrote data before this
//! crate existed. [`StoredMessage`] is the same message once its mailbox key and
//! both participants are known, which is what the local cache and the UI see.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum size of a text or system message body in bytes (64 KB).
pub const MAX_TEXT_SIZE: usize = 64 * 1024;

/// Maximum size of an inline media payload (base64 data URL) in bytes.
pub const MAX_MEDIA_SIZE: usize = 4 * 1024 * 1024;

/// Identifies a user account. Also used as a mailbox path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Creates a user identifier from its string form.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form of this identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Millisecond-precision UTC timestamp.
///
/// Assigned once when a message is created and never changed afterwards; it
/// is the ordering key of every conversation view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later.
    #[must_use]
    pub const fn since(&self, earlier: Self) -> std::time::Duration {
        std::time::Duration::from_millis(self.0.saturating_sub(earlier.0))
    }

    /// Returns a timestamp `millis` later than this one.
    #[must_use]
    pub const fn plus_millis(&self, millis: u64) -> Self {
        Self(self.0.saturating_add(millis))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// The kind tag carried in the `type` field of every message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Plain text.
    #[default]
    Text,
    /// Inline image as a base64 data URL.
    Image,
    /// Animated GIF referenced by URL.
    Gif,
    /// Voice message, inline or referenced by URL.
    Audio,
    /// Client-generated notice (e.g. "User disconnected.").
    System,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Gif => "gif",
            Self::Audio => "audio",
            Self::System => "system",
        };
        f.write_str(name)
    }
}

/// Error returned when a message body fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Message content is empty.
    #[error("message content is empty")]
    Empty,
    /// Message content exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the content in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
    /// Image payload is not an image data URL.
    #[error("image content must be a data:image/ URL")]
    NotImageData,
    /// Media reference is neither an http(s) URL nor an accepted data URL.
    #[error("invalid media URL: {0}")]
    InvalidUrl(String),
}

/// Content of a message, tagged by kind.
///
/// Each variant carries exactly the fields its kind needs, under the legacy
/// field names. Use the constructors to build a body; they enforce the
/// per-kind rules so consumers never re-check them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageBody {
    /// Plain text.
    Text {
        /// Message text, newlines preserved.
        text: String,
    },
    /// Inline image.
    Image {
        /// `data:image/...;base64,...` URL.
        image: String,
    },
    /// Animated GIF.
    Gif {
        /// GIF URL.
        content: String,
    },
    /// Voice message.
    Audio {
        /// `data:audio/...;base64,...` URL or http(s) URL.
        audio: String,
        /// Length of the recording, if known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<AudioDuration>,
    },
    /// Client-generated notice.
    System {
        /// Notice text.
        text: String,
    },
}

impl MessageBody {
    /// Builds a text body.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Empty`] for blank text or
    /// [`ValidationError::TooLarge`] above [`MAX_TEXT_SIZE`].
    pub fn text(text: impl Into<String>) -> Result<Self, ValidationError> {
        let body = Self::Text { text: text.into() };
        body.validate()?;
        Ok(body)
    }

    /// Builds an image body from a base64 data URL.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if the payload is empty, too large, or not
    /// a `data:image/` URL.
    pub fn image(data_url: impl Into<String>) -> Result<Self, ValidationError> {
        let body = Self::Image {
            image: data_url.into(),
        };
        body.validate()?;
        Ok(body)
    }

    /// Builds a GIF body from an http(s) URL.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidUrl`] if `url` is not http(s).
    pub fn gif(url: impl Into<String>) -> Result<Self, ValidationError> {
        let body = Self::Gif {
            content: url.into(),
        };
        body.validate()?;
        Ok(body)
    }

    /// Builds a voice message body from a `data:audio/` URL or an http(s)
    /// URL.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidUrl`] for any other URL, or
    /// [`ValidationError::TooLarge`] for an inline recording above
    /// [`MAX_MEDIA_SIZE`].
    pub fn audio(
        url: impl Into<String>,
        duration: Option<AudioDuration>,
    ) -> Result<Self, ValidationError> {
        let body = Self::Audio {
            audio: url.into(),
            duration,
        };
        body.validate()?;
        Ok(body)
    }

    /// Builds a system notice body.
    ///
    /// # Errors
    ///
    /// Same rules as [`MessageBody::text`].
    pub fn system(text: impl Into<String>) -> Result<Self, ValidationError> {
        let body = Self::System { text: text.into() };
        body.validate()?;
        Ok(body)
    }

    /// Returns the kind tag of this body.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::Text { .. } => MessageKind::Text,
            Self::Image { .. } => MessageKind::Image,
            Self::Gif { .. } => MessageKind::Gif,
            Self::Audio { .. } => MessageKind::Audio,
            Self::System { .. } => MessageKind::System,
        }
    }

    /// Returns the text of text and system messages.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } | Self::System { text } => Some(text),
            _ => None,
        }
    }

    /// Short human-readable stand-in used in reply previews.
    #[must_use]
    pub fn preview(&self) -> &str {
        match self {
            Self::Text { text } | Self::System { text } => text,
            Self::Image { .. } => "Photo",
            Self::Gif { .. } | Self::Audio { .. } => "Message",
        }
    }

    /// Checks the per-kind rules.
    ///
    /// Bodies decoded from storage bypass the constructors, so this is public
    /// for callers that want to re-check foreign data.
    ///
    /// # Errors
    ///
    /// Returns the first rule violated.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Text { text } | Self::System { text } => {
                if text.trim().is_empty() {
                    return Err(ValidationError::Empty);
                }
                check_size(text.len(), MAX_TEXT_SIZE)
            }
            Self::Image { image } => {
                if image.is_empty() {
                    return Err(ValidationError::Empty);
                }
                if !image.starts_with("data:image/") {
                    return Err(ValidationError::NotImageData);
                }
                check_size(image.len(), MAX_MEDIA_SIZE)
            }
            Self::Gif { content: url } => check_media_url(url),
            Self::Audio { audio, .. } => {
                if audio.starts_with("data:audio/") {
                    check_size(audio.len(), MAX_MEDIA_SIZE)
                } else {
                    check_media_url(audio)
                }
            }
        }
    }
}

const fn check_size(size: usize, max: usize) -> Result<(), ValidationError> {
    if size > max {
        return Err(ValidationError::TooLarge { size, max });
    }
    Ok(())
}

fn check_media_url(raw: &str) -> Result<(), ValidationError> {
    if raw.is_empty() {
        return Err(ValidationError::Empty);
    }
    let parsed = url::Url::parse(raw).map_err(|e| ValidationError::InvalidUrl(e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ValidationError::InvalidUrl(format!(
            "unsupported scheme `{other}`"
        ))),
    }
}

/// Length of a voice message.
///
/// Current clients write seconds; older ones wrote the display string
/// (`"0:07"`). Both decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AudioDuration {
    /// Length in seconds.
    Seconds(f64),
    /// Preformatted `m:ss` string.
    Clock(String),
}

impl AudioDuration {
    /// Length in seconds, `None` for a clock string that does not parse.
    #[must_use]
    pub fn as_secs(&self) -> Option<f64> {
        match self {
            Self::Seconds(secs) => Some(*secs),
            Self::Clock(clock) => {
                let (minutes, seconds) = clock.trim().split_once(':')?;
                let minutes: u32 = minutes.parse().ok()?;
                let seconds: u32 = seconds.parse().ok()?;
                Some(f64::from(minutes).mul_add(60.0, f64::from(seconds)))
            }
        }
    }
}

impl From<f64> for AudioDuration {
    fn from(secs: f64) -> Self {
        Self::Seconds(secs)
    }
}

impl std::fmt::Display for AudioDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Clock(clock) => f.write_str(clock),
            Self::Seconds(secs) => {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let whole = secs.max(0.0).round() as u64;
                write!(f, "{}:{:02}", whole / 60, whole % 60)
            }
        }
    }
}

/// Decodes `null` as the type's default.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Reference to an earlier message that a new message replies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyContext {
    /// Timestamp of the message being replied to.
    pub reply_to_id: Timestamp,
    /// Display name of that message's author.
    #[serde(default, deserialize_with = "null_as_default")]
    pub reply_to_name: String,
    /// Preview text of that message.
    #[serde(default, deserialize_with = "null_as_default")]
    pub reply_to_text: String,
    /// Kind of that message; old replies omit it and are treated as text.
    #[serde(default, deserialize_with = "null_as_default")]
    pub reply_to_type: MessageKind,
    /// Image data of that message, for image replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_image: Option<String>,
}

impl ReplyContext {
    /// Builds a reply reference to `original`, authored by `author_name`.
    #[must_use]
    pub fn to(original: &StoredMessage, author_name: impl Into<String>) -> Self {
        let reply_to_image = match &original.body {
            MessageBody::Image { image } => Some(image.clone()),
            _ => None,
        };
        Self {
            reply_to_id: original.timestamp,
            reply_to_name: author_name.into(),
            reply_to_text: original.body.preview().to_string(),
            reply_to_type: original.body.kind(),
            reply_to_image,
        }
    }
}

/// A message as stored under a mailbox path.
///
/// The recipient and the key are implied by the path, so they are not part of
/// the value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxRecord {
    /// Kind-tagged content (flattened into `type` + content field).
    #[serde(flatten)]
    pub body: MessageBody,
    /// Creation time; the ordering and deduplication key.
    pub timestamp: Timestamp,
    /// Author of the message.
    pub sender: UserId,
    /// Author display name, if the sending client attached one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// Whether the recipient has read the message.
    #[serde(default)]
    pub read: bool,
    /// Whether the recipient has drained the message from its pending inbox.
    #[serde(default)]
    pub delivered: bool,
    /// Message this one replies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_context: Option<ReplyContext>,
}

/// A message with its identity and both participants resolved.
///
/// Persisted in the local cache and handed to the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    /// Mailbox key when the message came from the mailbox, otherwise a
    /// locally assigned identifier.
    pub id: String,
    /// Author of the message.
    pub sender_id: UserId,
    /// Addressee of the message.
    pub recipient_id: UserId,
    /// Kind-tagged content.
    #[serde(flatten)]
    pub body: MessageBody,
    /// Creation time; the ordering and deduplication key.
    pub timestamp: Timestamp,
    /// Whether the recipient has drained the message.
    #[serde(default)]
    pub delivered: bool,
    /// Whether the recipient has read the message.
    #[serde(default)]
    pub read: bool,
    /// Author display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// Message this one replies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_context: Option<ReplyContext>,
}

impl StoredMessage {
    /// Resolves a mailbox record read from under key `id`, addressed to
    /// `recipient`.
    #[must_use]
    pub fn from_record(id: impl Into<String>, recipient: UserId, record: MailboxRecord) -> Self {
        Self {
            id: id.into(),
            sender_id: record.sender,
            recipient_id: recipient,
            body: record.body,
            timestamp: record.timestamp,
            delivered: record.delivered,
            read: record.read,
            sender_name: record.sender_name,
            reply_context: record.reply_context,
        }
    }

    /// Produces the mailbox value for this message.
    #[must_use]
    pub fn to_record(&self) -> MailboxRecord {
        MailboxRecord {
            body: self.body.clone(),
            timestamp: self.timestamp,
            sender: self.sender_id.clone(),
            sender_name: self.sender_name.clone(),
            read: self.read,
            delivered: self.delivered,
            reply_context: self.reply_context.clone(),
        }
    }

    /// Returns the kind tag of this message.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        self.body.kind()
    }
}

/// Delivery lifecycle of an outbound message as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Queued locally, not yet accepted by the mailbox.
    Sending,
    /// Written to the recipient's pending inbox.
    Sent,
    /// Drained from the recipient's pending inbox.
    Delivered,
    /// Retry budget exhausted; waits for a manual retry.
    Failed,
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Generates a new mailbox key.
///
/// Keys are UUID v7 in simple (unhyphenated) form, so their lexical order is
/// their creation order.
#[must_use]
pub fn push_key() -> String {
    Uuid::now_v7().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_ordering() {
        let t1 = Timestamp::from_millis(1000);
        let t2 = Timestamp::from_millis(2000);
        assert!(t1 < t2);
        assert_eq!(t2.since(t1), std::time::Duration::from_secs(1));
        assert_eq!(t1.since(t2), std::time::Duration::ZERO);
    }

    #[test]
    fn text_body_rejects_blank_text() {
        assert_eq!(MessageBody::text("   "), Err(ValidationError::Empty));
        assert_eq!(MessageBody::text(""), Err(ValidationError::Empty));
    }

    #[test]
    fn text_body_rejects_oversized_text() {
        let result = MessageBody::text("a".repeat(MAX_TEXT_SIZE + 1));
        assert!(matches!(result, Err(ValidationError::TooLarge { .. })));
    }

    #[test]
    fn text_body_keeps_newlines() {
        let body = MessageBody::text("line one\nline two").unwrap();
        assert_eq!(body.as_text(), Some("line one\nline two"));
    }

    #[test]
    fn image_body_requires_data_url() {
        assert_eq!(
            MessageBody::image("https://example.com/a.png"),
            Err(ValidationError::NotImageData)
        );
        assert!(MessageBody::image("data:image/jpeg;base64,AAAA").is_ok());
    }

    #[test]
    fn gif_body_requires_http_url() {
        assert!(MessageBody::gif("https://media.example.com/cat.gif").is_ok());
        assert!(matches!(
            MessageBody::gif("ftp://example.com/cat.gif"),
            Err(ValidationError::InvalidUrl(_))
        ));
        assert!(matches!(
            MessageBody::gif("not a url"),
            Err(ValidationError::InvalidUrl(_))
        ));
    }

    #[test]
    fn audio_body_accepts_inline_recording() {
        assert!(MessageBody::audio("data:audio/webm;base64,GkXfo59ChoEB", None).is_ok());
        assert!(matches!(
            MessageBody::audio("data:text/plain;base64,AAAA", None),
            Err(ValidationError::InvalidUrl(_))
        ));
        let oversized = format!("data:audio/webm;base64,{}", "A".repeat(MAX_MEDIA_SIZE));
        assert!(matches!(
            MessageBody::audio(oversized, None),
            Err(ValidationError::TooLarge { .. })
        ));
    }

    #[test]
    fn legacy_audio_record_with_clock_duration_decodes() {
        let json = r#"{
            "type": "audio",
            "audio": "data:audio/webm;codecs=opus;base64,GkXfo59ChoEB",
            "duration": "0:07",
            "timestamp": 1700000000123,
            "sender": "bob",
            "read": false,
            "delivered": false
        }"#;
        let record: MailboxRecord = serde_json::from_str(json).unwrap();
        let MessageBody::Audio { duration, .. } = &record.body else {
            panic!("expected audio, got {:?}", record.body);
        };
        let duration = duration.as_ref().unwrap();
        assert_eq!(duration, &AudioDuration::Clock("0:07".into()));
        assert_eq!(duration.as_secs(), Some(7.0));
        assert!(record.body.validate().is_ok());

        // Re-encoding keeps the string form older clients render.
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["duration"], "0:07");
    }

    #[test]
    fn numeric_duration_displays_as_clock() {
        assert_eq!(AudioDuration::from(65.4).to_string(), "1:05");
        assert_eq!(AudioDuration::Clock("2:30".into()).as_secs(), Some(150.0));
        assert_eq!(AudioDuration::Clock("soon".into()).as_secs(), None);
    }

    #[test]
    fn reply_context_without_type_defaults_to_text() {
        let json = r#"{"replyToId":5,"replyToName":null,"replyToText":"hey","replyToImage":null}"#;
        let reply: ReplyContext = serde_json::from_str(json).unwrap();
        assert_eq!(reply.reply_to_type, MessageKind::Text);
        assert_eq!(reply.reply_to_name, "");
        assert_eq!(reply.reply_to_image, None);
    }

    #[test]
    fn text_record_uses_legacy_shape() {
        let record = MailboxRecord {
            body: MessageBody::text("hello").unwrap(),
            timestamp: Timestamp::from_millis(1_700_000_000_000),
            sender: UserId::new("alice"),
            sender_name: None,
            read: false,
            delivered: false,
            reply_context: None,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "text",
                "text": "hello",
                "timestamp": 1_700_000_000_000_u64,
                "sender": "alice",
                "read": false,
                "delivered": false,
            })
        );
    }

    #[test]
    fn legacy_gif_record_decodes() {
        let json = r#"{
            "type": "gif",
            "content": "https://media.example.com/x.gif",
            "timestamp": 42,
            "sender": "bob",
            "senderName": "Bob",
            "read": false,
            "delivered": true
        }"#;
        let record: MailboxRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.body.kind(), MessageKind::Gif);
        assert_eq!(record.sender_name.as_deref(), Some("Bob"));
        assert!(record.delivered);
    }

    #[test]
    fn legacy_record_with_unknown_fields_decodes() {
        let json = r#"{"type":"text","text":"hi","timestamp":7,"sender":"bob",
            "linkMeta":{"title":"x"}}"#;
        let record: MailboxRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.body.as_text(), Some("hi"));
        assert!(!record.read);
    }

    #[test]
    fn reply_context_round_trips_legacy_names() {
        let original = StoredMessage {
            id: "k1".into(),
            sender_id: UserId::new("bob"),
            recipient_id: UserId::new("alice"),
            body: MessageBody::image("data:image/png;base64,AAAA").unwrap(),
            timestamp: Timestamp::from_millis(10),
            delivered: true,
            read: false,
            sender_name: Some("Bob".into()),
            reply_context: None,
        };
        let reply = ReplyContext::to(&original, "Bob");
        assert_eq!(reply.reply_to_text, "Photo");
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["replyToId"], 10);
        assert_eq!(json["replyToType"], "image");
        assert_eq!(json["replyToImage"], "data:image/png;base64,AAAA");
    }

    #[test]
    fn stored_message_record_conversion_keeps_fields() {
        let record = MailboxRecord {
            body: MessageBody::audio("https://cdn.example.com/v.webm", Some(3.5.into())).unwrap(),
            timestamp: Timestamp::from_millis(99),
            sender: UserId::new("alice"),
            sender_name: Some("Alice".into()),
            read: false,
            delivered: false,
            reply_context: None,
        };
        let stored = StoredMessage::from_record("key-1", UserId::new("bob"), record.clone());
        assert_eq!(stored.id, "key-1");
        assert_eq!(stored.recipient_id, UserId::new("bob"));
        assert_eq!(stored.to_record(), record);
    }

    #[test]
    fn push_keys_are_ordered_and_unique() {
        let a = push_key();
        let b = push_key();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a < b);
    }

    #[test]
    fn delivery_status_serializes_lowercase() {
        let json = serde_json::to_string(&DeliveryStatus::Delivered).unwrap();
        assert_eq!(json, "\"delivered\"");
        assert_eq!(DeliveryStatus::Failed.to_string(), "failed");
    }
}
