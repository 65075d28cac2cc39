//! Rooms group the sessions editing the same document.

use crate::message::Delivery;
use crate::session::SessionId;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// A room identifier.
pub type RoomId = String;

/// Outbound queue of one session.
pub type SessionSender = mpsc::UnboundedSender<Delivery>;

/// Receiving half of a session's outbound queue.
pub type SessionReceiver = mpsc::UnboundedReceiver<Delivery>;

/// Validate a room name.
///
/// Any non-empty name is accepted, whatever its length or characters;
/// rooms are open to every client.
///
/// # Errors
///
/// Returns an error message if the room name is empty.
pub fn validate_room_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Room name cannot be empty");
    }
    Ok(())
}

/// The members of one room.
///
/// A room only routes to its members' queues; sessions own their own
/// lifecycle.
#[derive(Debug)]
pub struct Room {
    name: RoomId,
    members: HashMap<SessionId, SessionSender>,
}

impl Room {
    /// Create an empty room.
    #[must_use]
    pub fn new(name: impl Into<RoomId>) -> Self {
        Self {
            name: name.into(),
            members: HashMap::new(),
        }
    }

    /// Get the room name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the number of members.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Check if a session is a member.
    #[must_use]
    pub fn is_member(&self, session: &SessionId) -> bool {
        self.members.contains_key(session)
    }

    /// Add a session to the room.
    ///
    /// Returns `true` if the session was not already a member. Joining twice
    /// keeps the original membership.
    pub fn join(&mut self, session: SessionId, outbox: SessionSender) -> bool {
        if self.members.contains_key(&session) {
            return false;
        }
        debug!(room = %self.name, session = %session, "Session joined room");
        self.members.insert(session, outbox);
        true
    }

    /// Remove a session from the room.
    ///
    /// Returns `true` if the session was a member.
    pub fn leave(&mut self, session: &SessionId) -> bool {
        let removed = self.members.remove(session).is_some();
        if removed {
            debug!(room = %self.name, session = %session, "Session left room");
        }
        removed
    }

    /// Queue a delivery for every member except `except`.
    ///
    /// Returns the number of members whose queue accepted it. Members whose
    /// session already went away are skipped.
    pub fn deliver(&self, delivery: &Delivery, except: Option<&SessionId>) -> usize {
        let mut delivered = 0;
        for (session, outbox) in &self.members {
            if Some(session) == except {
                continue;
            }
            if outbox.send(delivery.clone()).is_ok() {
                delivered += 1;
            } else {
                trace!(room = %self.name, session = %session, "Dropped delivery to closed session");
            }
        }
        delivered
    }

    /// Check if the room has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
