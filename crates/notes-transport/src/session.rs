//! Live editing session.
//!
//! A [`LiveSession`] is the editor side of a room: it performs the
//! `connected`/`join` handshake, debounces local edits into `live_update`
//! events and surfaces what the server sends back.
//!
//! ```rust,ignore
//! use studynotes_transport::LiveSession;
//!
//! let mut session = LiveSession::connect("ws://127.0.0.1:8080/ws", Some(1.into()), String::new()).await?;
//! session.edit("<p>Hello</p>")?;
//! session.save()?;
//! while let Some(content) = session.next_remote_update().await {
//!     render(&content);
//! }
//! ```

use serde_json::Value;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use studynotes_core::{DebouncedEmitter, EmitterConfig, EmitterState, EmitterStats};
use studynotes_protocol::{ClientEvent, NoteId, ServerEvent, PROTOCOL_VERSION};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, info, trace, warn};

use crate::traits::{Connection, TransportError};

/// How long the server may take to greet and confirm the join.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// An editor attached to one room.
pub struct LiveSession {
    session_id: String,
    room: String,
    note_id: Option<NoteId>,
    emitter: DebouncedEmitter,
    outbound: mpsc::UnboundedSender<ClientEvent>,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    pump: JoinHandle<Result<(), TransportError>>,
}

impl LiveSession {
    /// Connect over WebSocket and join the room of `note_id`, or the default
    /// room without one.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or handshake fails.
    #[cfg(feature = "websocket")]
    pub async fn connect(
        url: &str,
        note_id: Option<NoteId>,
        initial: String,
    ) -> Result<Self, TransportError> {
        Self::connect_with(url, EmitterConfig::for_note(note_id), initial).await
    }

    /// Connect over WebSocket with an explicit emitter configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or handshake fails.
    #[cfg(feature = "websocket")]
    pub async fn connect_with(
        url: &str,
        config: EmitterConfig,
        initial: String,
    ) -> Result<Self, TransportError> {
        let conn = crate::websocket::WebSocketConnection::connect(url).await?;
        Self::over(conn, config, initial).await
    }

    /// Run a session over an already open connection.
    ///
    /// `initial` is the document content the editor starts from.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is incompatible, rejects the join or
    /// does not answer within [`HANDSHAKE_TIMEOUT`].
    pub async fn over<C>(
        mut conn: C,
        config: EmitterConfig,
        initial: String,
    ) -> Result<Self, TransportError>
    where
        C: Connection + 'static,
    {
        let (events_tx, events) = mpsc::unbounded_channel();

        let greeting = timeout(
            HANDSHAKE_TIMEOUT,
            handshake(&mut conn, &config.room, &events_tx),
        )
        .await
        .map_err(|_| TransportError::Timeout)?;

        let (session_id, heartbeat) = match greeting {
            Ok(greeting) => greeting,
            Err(e) => {
                let _ = conn.close().await;
                return Err(e);
            }
        };

        info!(session = %session_id, room = %config.room, "Joined room");

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let room = config.room.clone();
        let note_id = config.note_id.clone();
        let emitter = DebouncedEmitter::spawn(config, initial, outbound.clone());
        let pump = tokio::spawn(pump(conn, outbound_rx, events_tx, heartbeat));

        Ok(Self {
            session_id,
            room,
            note_id,
            emitter,
            outbound,
            events,
            pump,
        })
    }

    /// Session identifier assigned by the server.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Room this session edits.
    #[must_use]
    pub fn room(&self) -> &str {
        &self.room
    }

    /// Note backing the room, if any.
    #[must_use]
    pub fn note_id(&self) -> Option<&NoteId> {
        self.note_id.as_ref()
    }

    /// Record a local edit. It is sent once typing pauses.
    ///
    /// # Errors
    ///
    /// Returns an error if the session has stopped.
    pub fn edit(&self, content: impl Into<String>) -> Result<(), TransportError> {
        Ok(self.emitter.edit(content)?)
    }

    /// Send the current content immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the session has stopped.
    pub fn save(&self) -> Result<(), TransportError> {
        Ok(self.emitter.save()?)
    }

    /// Whether an edit is waiting to be sent.
    ///
    /// # Errors
    ///
    /// Returns an error if the session has stopped.
    pub async fn state(&self) -> Result<EmitterState, TransportError> {
        Ok(self.emitter.state().await?)
    }

    /// Share the caret position with the room.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is gone.
    pub fn move_cursor(
        &self,
        position: Value,
        user_id: Option<Value>,
    ) -> Result<(), TransportError> {
        self.outbound
            .send(ClientEvent::CursorPosition {
                room: self.room.clone(),
                position,
                user_id,
            })
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Next event from the server.
    ///
    /// A `remote_update` replaces the local content before it is returned.
    /// Returns `None` once the connection has closed.
    pub async fn next_event(&mut self) -> Option<ServerEvent> {
        let event = self.events.recv().await?;
        if let ServerEvent::RemoteUpdate { content } = &event {
            if let Err(e) = self.emitter.apply_remote(content.clone()) {
                warn!(session = %self.session_id, "Dropping remote update: {}", e);
            }
        }
        Some(event)
    }

    /// Next `remote_update` content, skipping other events.
    pub async fn next_remote_update(&mut self) -> Option<String> {
        loop {
            if let ServerEvent::RemoteUpdate { content } = self.next_event().await? {
                return Some(content);
            }
        }
    }

    /// Flush a pending edit, leave the room and close the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection failed while the session ran.
    pub async fn close(self) -> Result<EmitterStats, TransportError> {
        let stats = self.emitter.close().await;
        let _ = self.outbound.send(ClientEvent::leave(self.room.clone()));
        drop(self.outbound);

        let result = self
            .pump
            .await
            .map_err(|e| TransportError::Other(format!("session task failed: {e}")))?;

        debug!(
            session = %self.session_id,
            edits = stats.edits,
            emissions = stats.emissions,
            "Session closed"
        );
        result.map(|()| stats)
    }
}

/// Wait for `connected`, check the version and join `room`.
///
/// Events that arrive between the join and its confirmation are queued for
/// the application.
async fn handshake<C: Connection>(
    conn: &mut C,
    room: &str,
    events: &mpsc::UnboundedSender<ServerEvent>,
) -> Result<(String, Duration), TransportError> {
    let (session_id, heartbeat) = match conn.recv().await? {
        Some(ServerEvent::Connected {
            session_id,
            version,
            heartbeat,
        }) => {
            if !PROTOCOL_VERSION.accepts_major(version) {
                return Err(TransportError::IncompatibleVersion(version));
            }
            (session_id, Duration::from_millis(heartbeat.into()))
        }
        Some(other) => return Err(TransportError::Unexpected(other.name())),
        None => return Err(TransportError::ConnectionClosed),
    };

    conn.send(&ClientEvent::join(room)).await?;

    loop {
        match conn.recv().await? {
            Some(ServerEvent::UserJoined { active_users }) => {
                debug!(session = %session_id, room, active_users, "Join confirmed");
                return Ok((session_id, heartbeat));
            }
            Some(ServerEvent::Error { code, message }) => {
                return Err(TransportError::Rejected { code, message });
            }
            Some(event) => {
                let _ = events.send(event);
            }
            None => return Err(TransportError::ConnectionClosed),
        }
    }
}

/// Move events between the connection, the emitter and the application.
///
/// Ends when every outbound sender is gone or the server closes.
async fn pump<C: Connection>(
    mut conn: C,
    mut outbound: mpsc::UnboundedReceiver<ClientEvent>,
    events: mpsc::UnboundedSender<ServerEvent>,
    heartbeat: Duration,
) -> Result<(), TransportError> {
    let keepalive = !heartbeat.is_zero();
    let period = if keepalive {
        heartbeat
    } else {
        Duration::from_secs(3600)
    };
    let mut ticker = interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            outgoing = outbound.recv() => match outgoing {
                Some(event) => conn.send(&event).await?,
                None => break,
            },

            incoming = conn.recv() => match incoming? {
                Some(ServerEvent::Pong { timestamp }) => {
                    trace!(?timestamp, "Pong");
                }
                Some(event) => {
                    let _ = events.send(event);
                }
                None => {
                    debug!("Server closed the connection");
                    return Ok(());
                }
            },

            _ = ticker.tick(), if keepalive => {
                conn.send(&ClientEvent::ping(unix_millis())).await?;
            }
        }
    }

    conn.close().await
}

fn unix_millis() -> Option<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_millis() as u64)
}
