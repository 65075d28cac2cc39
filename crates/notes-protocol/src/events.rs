//! Event types for the live editor protocol.
//!
//! Every message is an envelope `{"event": <name>, "data": {...}}`. Event
//! names and payload fields are fixed for compatibility with existing
//! browser clients.

use crate::room::NoteId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error codes carried by [`ServerEvent::Error`].
pub mod codes {
    /// The frame could not be decoded or was missing fields.
    pub const MALFORMED: u16 = 1001;
    /// The room name was rejected.
    pub const INVALID_ROOM: u16 = 1002;
    /// The update could not be persisted and was not broadcast.
    pub const PERSIST_FAILED: u16 = 1003;
    /// The session is not a member of the room.
    pub const NOT_IN_ROOM: u16 = 1004;
}

/// Events sent by an editor to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Join a room to receive its updates.
    Join {
        /// Room to join.
        room: String,
    },

    /// Leave a room.
    Leave {
        /// Room to leave.
        room: String,
    },

    /// Replace the document content.
    LiveUpdate {
        /// Room the edit belongs to.
        room: String,
        /// Full content snapshot (rich-text markup).
        content: String,
        /// Note backing the room.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note_id: Option<NoteId>,
    },

    /// Caret position for collaboration awareness.
    CursorPosition {
        /// Room the cursor belongs to.
        room: String,
        /// Editor-defined position payload.
        position: Value,
        /// Optional client-chosen user identifier.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<Value>,
    },

    /// Keepalive ping.
    Ping {
        /// Optional timestamp echoed in the pong.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ClientEvent {
    /// Wire name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Join { .. } => "join",
            ClientEvent::Leave { .. } => "leave",
            ClientEvent::LiveUpdate { .. } => "live_update",
            ClientEvent::CursorPosition { .. } => "cursor_position",
            ClientEvent::Ping { .. } => "ping",
        }
    }

    /// Create a `join` event.
    #[must_use]
    pub fn join(room: impl Into<String>) -> Self {
        ClientEvent::Join { room: room.into() }
    }

    /// Create a `leave` event.
    #[must_use]
    pub fn leave(room: impl Into<String>) -> Self {
        ClientEvent::Leave { room: room.into() }
    }

    /// Create a `live_update` event.
    #[must_use]
    pub fn live_update(
        room: impl Into<String>,
        content: impl Into<String>,
        note_id: Option<NoteId>,
    ) -> Self {
        ClientEvent::LiveUpdate {
            room: room.into(),
            content: content.into(),
            note_id,
        }
    }

    /// Create a `ping` event.
    #[must_use]
    pub fn ping(timestamp: Option<u64>) -> Self {
        ClientEvent::Ping { timestamp }
    }
}

/// Events sent by the server to editors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Sent once when the connection is established.
    Connected {
        /// Server-assigned session identifier.
        session_id: String,
        /// Protocol major version.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// Content committed by another member of the room.
    RemoteUpdate {
        /// The committed content.
        content: String,
    },

    /// A session joined the room.
    UserJoined {
        /// Members currently in the room.
        active_users: usize,
    },

    /// A session left the room.
    UserLeft {
        /// Members currently in the room.
        active_users: usize,
    },

    /// Another member moved their cursor.
    CursorMoved {
        /// User identifier supplied by that member.
        user_id: Option<Value>,
        /// Position payload supplied by that member.
        position: Value,
    },

    /// A request from this session failed.
    Error {
        /// Error code, see [`codes`].
        code: u16,
        /// Human-readable message.
        message: String,
    },

    /// Keepalive pong.
    Pong {
        /// Timestamp echoed from the ping.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl ServerEvent {
    /// Wire name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::RemoteUpdate { .. } => "remote_update",
            ServerEvent::UserJoined { .. } => "user_joined",
            ServerEvent::UserLeft { .. } => "user_left",
            ServerEvent::CursorMoved { .. } => "cursor_moved",
            ServerEvent::Error { .. } => "error",
            ServerEvent::Pong { .. } => "pong",
        }
    }

    /// Create a `remote_update` event.
    #[must_use]
    pub fn remote_update(content: impl Into<String>) -> Self {
        ServerEvent::RemoteUpdate {
            content: content.into(),
        }
    }

    /// Create an `error` event.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code,
            message: message.into(),
        }
    }

    /// Create a `connected` event.
    #[must_use]
    pub fn connected(session_id: impl Into<String>, version: u8, heartbeat: u32) -> Self {
        ServerEvent::Connected {
            session_id: session_id.into(),
            version,
            heartbeat,
        }
    }
}
