//! JSON encoding for mailbox frames.
//!
//! Frames travel as WebSocket text messages, one frame per message, so no
//! length prefix is needed. Decoding enforces [`MAX_FRAME_SIZE`] before
//! parsing.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Largest frame accepted by [`decode`] (8 MB).
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Frame exceeds the size limit.
    #[error("frame too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual frame size in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

/// Encodes a frame as a JSON string.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the frame cannot be serialized.
pub fn encode<T: Serialize>(frame: &T) -> Result<String, CodecError> {
    serde_json::to_string(frame).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a frame from a JSON string, rejecting anything above
/// [`MAX_FRAME_SIZE`].
///
/// # Errors
///
/// Returns `CodecError::TooLarge` or `CodecError::Serialization`.
pub fn decode<T: DeserializeOwned>(text: &str) -> Result<T, CodecError> {
    decode_with_limit(text, MAX_FRAME_SIZE)
}

/// Decodes a frame with a caller-supplied size limit.
///
/// # Errors
///
/// Returns `CodecError::TooLarge` if `text` is longer than `max`, or
/// `CodecError::Serialization` if it is not a valid frame.
pub fn decode_with_limit<T: DeserializeOwned>(text: &str, max: usize) -> Result<T, CodecError> {
    if text.len() > max {
        return Err(CodecError::TooLarge {
            size: text.len(),
            max,
        });
    }
    serde_json::from_str(text).map_err(|e| CodecError::Serialization(e.to_string()))
}
