//! Client connection abstraction.
//!
//! A [`Connection`] carries [`ClientEvent`]s to the server and hands back the
//! [`ServerEvent`]s it receives, hiding the framing underneath.

use async_trait::async_trait;
use studynotes_core::EmitError;
use studynotes_protocol::{ClientEvent, Encoding, ProtocolError, ServerEvent};
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection timed out.
    #[error("Connection timed out")]
    Timeout,

    /// The WebSocket handshake failed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Incoming message exceeds the configured limit.
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The server speaks an incompatible protocol version.
    #[error("Incompatible protocol version {0}")]
    IncompatibleVersion(u8),

    /// The server answered with something other than what was expected.
    #[error("Unexpected event: {0}")]
    Unexpected(&'static str),

    /// The server rejected a request.
    #[error("Rejected ({code}): {message}")]
    Rejected { code: u16, message: String },

    /// The edit emitter stopped.
    #[error(transparent)]
    Emitter(#[from] EmitError),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// An open connection to a Study Notes server.
#[async_trait]
pub trait Connection: Send {
    /// Receive the next event from the server.
    ///
    /// Returns `None` if the connection is closed cleanly.
    async fn recv(&mut self) -> Result<Option<ServerEvent>, TransportError>;

    /// Send an event to the server.
    async fn send(&mut self, event: &ClientEvent) -> Result<(), TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Encoding used for outgoing events.
    fn encoding(&self) -> Encoding {
        Encoding::Json
    }

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;
}
