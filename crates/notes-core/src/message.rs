//! Messages queued for delivery to sessions.

use crate::session::SessionId;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use studynotes_protocol::ServerEvent;

/// Current wall-clock time in epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// A server event addressed to one session.
///
/// The event itself is shared, so fanning one update out to a large room
/// clones a pointer per member rather than the content.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Room the event was routed through, if any.
    pub room: Option<String>,
    /// Session whose action caused the event.
    pub source: Option<SessionId>,
    /// The event.
    pub event: Arc<ServerEvent>,
}

impl Delivery {
    /// Create a delivery not tied to a room.
    #[must_use]
    pub fn new(event: ServerEvent) -> Self {
        Self {
            room: None,
            source: None,
            event: Arc::new(event),
        }
    }

    /// Attach the room the event was routed through.
    #[must_use]
    pub fn in_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    /// Attach the session that caused the event.
    #[must_use]
    pub fn with_source(mut self, source: SessionId) -> Self {
        self.source = Some(source);
        self
    }

    /// The event to deliver.
    #[must_use]
    pub fn event(&self) -> &ServerEvent {
        &self.event
    }
}
