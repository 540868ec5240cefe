//! JSON encoding for persistent-connection frames.
//!
//! Server frames are decoded in two steps so that an event the client does
//! not know yet is reported as [`CodecError::UnknownEvent`] instead of a
//! generic parse failure; transports log and skip those.

use serde::Deserialize;

use crate::event::{ClientEvent, EventName, ServerEvent};

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The frame is valid JSON but names an event this client does not handle.
    #[error("unknown event {0:?}")]
    UnknownEvent(String),
}

#[derive(Deserialize)]
struct FrameHeader {
    event: String,
}

/// Encodes a client frame as JSON text.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the event cannot be serialized.
pub fn encode_client(event: &ClientEvent) -> Result<String, CodecError> {
    serde_json::to_string(event).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a client frame (used by in-process servers in tests).
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the text is not a valid client frame.
pub fn decode_client(text: &str) -> Result<ClientEvent, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Encodes a server frame as JSON text.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the event cannot be serialized.
pub fn encode_server(event: &ServerEvent) -> Result<String, CodecError> {
    serde_json::to_string(event).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a server frame from JSON text.
///
/// # Errors
///
/// Returns `CodecError::UnknownEvent` for a well-formed frame with an
/// unrecognised event name, or `CodecError::Serialization` for anything that
/// is not a valid frame.
pub fn decode_server(text: &str) -> Result<ServerEvent, CodecError> {
    let header: FrameHeader =
        serde_json::from_str(text).map_err(|e| CodecError::Serialization(e.to_string()))?;
    if EventName::from_wire(&header.event).is_none() {
        return Err(CodecError::UnknownEvent(header.event));
    }
    serde_json::from_str(text).map_err(|e| CodecError::Serialization(e.to_string()))
}
