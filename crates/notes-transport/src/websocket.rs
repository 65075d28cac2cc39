//! WebSocket connection using tokio-tungstenite.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use studynotes_protocol::{codec, ClientEvent, Encoding, ServerEvent, WireFrame};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, trace, warn};

use crate::traits::{Connection, TransportError};

/// WebSocket connection configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Encoding for outgoing events.
    pub encoding: Encoding,
    /// Maximum incoming message size in bytes.
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            encoding: Encoding::Json,
            max_message_size: 1024 * 1024, // 1 MiB
        }
    }
}

/// A client WebSocket connection.
pub struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    config: WebSocketConfig,
    is_open: bool,
}

impl WebSocketConnection {
    /// Connect to `url` (e.g. `ws://127.0.0.1:8080/ws`) with default settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the TCP connection or handshake fails.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        Self::connect_with(url, WebSocketConfig::default()).await
    }

    /// Connect to `url` with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the TCP connection or handshake fails.
    pub async fn connect_with(url: &str, config: WebSocketConfig) -> Result<Self, TransportError> {
        let (stream, response) = connect_async(url).await.map_err(|e| {
            error!(url, "WebSocket handshake failed: {}", e);
            TransportError::Handshake(e.to_string())
        })?;

        debug!(url, status = %response.status(), "WebSocket connected");

        Ok(Self {
            stream,
            config,
            is_open: true,
        })
    }

    fn decode(&self, frame: WireFrame) -> Result<ServerEvent, TransportError> {
        if frame.len() > self.config.max_message_size {
            warn!(
                "Message too large: {} bytes (max: {})",
                frame.len(),
                self.config.max_message_size
            );
            return Err(TransportError::MessageTooLarge {
                size: frame.len(),
                max: self.config.max_message_size,
            });
        }
        Ok(codec::decode(&frame)?)
    }
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn recv(&mut self) -> Result<Option<ServerEvent>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return self.decode(WireFrame::Text(text)).map(Some);
                }
                Some(Ok(Message::Binary(data))) => {
                    return self.decode(WireFrame::Binary(data.into())).map(Some);
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {
                    // tungstenite queues the pong reply itself
                    trace!("Control frame");
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    debug!("WebSocket stream ended");
                    self.is_open = false;
                    return Ok(None);
                }
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    self.is_open = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }

    async fn send(&mut self, event: &ClientEvent) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }

        let message = match codec::encode(event, self.config.encoding)? {
            WireFrame::Text(text) => Message::Text(text),
            WireFrame::Binary(data) => Message::Binary(data.to_vec()),
        };

        trace!(event = event.name(), "Sending");
        self.stream
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.is_open {
            return Ok(());
        }
        self.is_open = false;

        match self.stream.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::Other(format!("Failed to close: {}", e))),
        }
    }

    fn encoding(&self) -> Encoding {
        self.config.encoding
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}
