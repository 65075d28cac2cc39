//! Codec for encoding and decoding protocol events.
//!
//! Text frames carry JSON, binary frames carry MessagePack with named fields.
//! Both encodings share the same envelope.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Maximum encoded event size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Encoding used on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// JSON in text frames.
    #[default]
    Json,
    /// MessagePack in binary frames.
    MessagePack,
}

/// An encoded event, ready to be written as a WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// Text frame.
    Text(String),
    /// Binary frame.
    Binary(Bytes),
}

impl WireFrame {
    /// Encoded length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            WireFrame::Text(text) => text.len(),
            WireFrame::Binary(data) => data.len(),
        }
    }

    /// Whether the frame is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encoding of this frame.
    #[must_use]
    pub fn encoding(&self) -> Encoding {
        match self {
            WireFrame::Text(_) => Encoding::Json,
            WireFrame::Binary(_) => Encoding::MessagePack,
        }
    }
}

/// Encode an event as JSON text.
///
/// # Errors
///
/// Returns an error if the event is too large or serialization fails.
pub fn encode_text<T: Serialize>(event: &T) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(event)?;
    check_size(text.len())?;
    Ok(text)
}

/// Encode an event as MessagePack.
///
/// # Errors
///
/// Returns an error if the event is too large or serialization fails.
pub fn encode_binary<T: Serialize>(event: &T) -> Result<Bytes, ProtocolError> {
    let payload = rmp_serde::to_vec_named(event)?;
    check_size(payload.len())?;
    Ok(Bytes::from(payload))
}

/// Encode an event with the given encoding.
///
/// # Errors
///
/// Returns an error if the event is too large or serialization fails.
pub fn encode<T: Serialize>(event: &T, encoding: Encoding) -> Result<WireFrame, ProtocolError> {
    match encoding {
        Encoding::Json => encode_text(event).map(WireFrame::Text),
        Encoding::MessagePack => encode_binary(event).map(WireFrame::Binary),
    }
}

/// Decode an event from JSON text.
///
/// # Errors
///
/// Returns an error if the text is too large, not JSON, or misses fields.
pub fn decode_text<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    check_size(text.len())?;
    Ok(serde_json::from_str(text)?)
}

/// Decode an event from MessagePack bytes.
///
/// # Errors
///
/// Returns an error if the data is too large or invalid.
pub fn decode_binary<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    check_size(data.len())?;
    Ok(rmp_serde::from_slice(data)?)
}

/// Decode an event from a wire frame.
///
/// # Errors
///
/// Returns an error if the frame cannot be decoded.
pub fn decode<T: DeserializeOwned>(frame: &WireFrame) -> Result<T, ProtocolError> {
    match frame {
        WireFrame::Text(text) => decode_text(text),
        WireFrame::Binary(data) => decode_binary(data),
    }
}

fn check_size(len: usize) -> Result<(), ProtocolError> {
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    Ok(())
}
