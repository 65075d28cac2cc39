//! Process-wide room membership registry.
//!
//! The registry knows every connected session's outbound queue and which
//! rooms it belongs to, and routes server events to room members.

use crate::message::Delivery;
use crate::room::{validate_room_name, Room, RoomId, SessionReceiver, SessionSender};
use crate::session::SessionId;
use dashmap::DashMap;
use std::collections::HashSet;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use studynotes_protocol::ServerEvent;

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Invalid room name.
    #[error("Invalid room name: {0}")]
    InvalidRoom(&'static str),

    /// The session is not connected.
    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    /// The session is not a member of the room.
    #[error("Not in room: {0}")]
    NotInRoom(String),

    /// The session reached its configured room limit.
    #[error("Maximum rooms per session reached")]
    MaxRoomsReached,
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum rooms one session may be in at once. `None` means unlimited.
    pub max_rooms_per_session: Option<usize>,
    /// Whether rooms are dropped once their last member leaves.
    pub prune_empty_rooms: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_rooms_per_session: None,
            prune_empty_rooms: true,
        }
    }
}

/// Result of a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    /// `false` if the session was already a member.
    pub newly_joined: bool,
    /// Members in the room after the join.
    pub members: usize,
}

#[derive(Debug)]
struct SessionEntry {
    outbox: SessionSender,
    rooms: HashSet<RoomId>,
}

/// The room registry.
///
/// Locks are always taken session entry first, room second, and never the
/// other way around.
pub struct RoomRegistry {
    /// Rooms indexed by name.
    rooms: DashMap<RoomId, Room>,
    /// Connected sessions and the rooms they are in.
    sessions: DashMap<SessionId, SessionEntry>,
    /// Configuration.
    config: RegistryConfig,
}

impl RoomRegistry {
    /// Create a registry with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a registry with custom configuration.
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Self {
        info!("Creating room registry with config: {:?}", config);
        Self {
            rooms: DashMap::new(),
            sessions: DashMap::new(),
            config,
        }
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            room_count: self.rooms.len(),
            session_count: self.sessions.len(),
            total_memberships: self.sessions.iter().map(|s| s.rooms.len()).sum(),
        }
    }

    /// Register a connected session.
    ///
    /// Returns the receiving end of the session's outbound queue. Connecting
    /// an ID that is already registered replaces its queue and drops its
    /// previous memberships.
    pub fn connect(&self, session: SessionId) -> SessionReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let previous = self.sessions.insert(
            session.clone(),
            SessionEntry {
                outbox: tx,
                rooms: HashSet::new(),
            },
        );
        if let Some(previous) = previous {
            warn!(session = %session, "Session reconnected, dropping previous memberships");
            self.remove_memberships(&session, previous.rooms);
        }
        debug!(session = %session, "Session connected");
        rx
    }

    /// Check whether a session is connected.
    #[must_use]
    pub fn is_connected(&self, session: &SessionId) -> bool {
        self.sessions.contains_key(session)
    }

    /// Add a session to a room, creating the room on demand.
    ///
    /// Joining a room the session is already in is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the room name is invalid, the session is not
    /// connected, or the session's room limit is reached.
    pub fn join(&self, session: &SessionId, room_name: &str) -> Result<JoinOutcome, RegistryError> {
        validate_room_name(room_name).map_err(RegistryError::InvalidRoom)?;

        let mut entry = self
            .sessions
            .get_mut(session)
            .ok_or_else(|| RegistryError::UnknownSession(session.clone()))?;

        if entry.rooms.contains(room_name) {
            drop(entry);
            return Ok(JoinOutcome {
                newly_joined: false,
                members: self.member_count(room_name),
            });
        }

        if let Some(max) = self.config.max_rooms_per_session {
            if entry.rooms.len() >= max {
                return Err(RegistryError::MaxRoomsReached);
            }
        }

        let members = {
            let mut room = self
                .rooms
                .entry(room_name.to_string())
                .or_insert_with(|| {
                    debug!(room = %room_name, "Creating new room");
                    Room::new(room_name)
                });
            room.join(session.clone(), entry.outbox.clone());
            room.member_count()
        };
        entry.rooms.insert(room_name.to_string());

        debug!(room = %room_name, session = %session, members, "Joined");

        Ok(JoinOutcome {
            newly_joined: true,
            members,
        })
    }

    /// Remove a session from one room.
    ///
    /// Returns the number of members left in the room.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is not in the room.
    pub fn leave(&self, session: &SessionId, room_name: &str) -> Result<usize, RegistryError> {
        let mut entry = self
            .sessions
            .get_mut(session)
            .ok_or_else(|| RegistryError::UnknownSession(session.clone()))?;

        if !entry.rooms.remove(room_name) {
            return Err(RegistryError::NotInRoom(room_name.to_string()));
        }

        let remaining = self.remove_from_room(session, room_name);
        drop(entry);

        debug!(room = %room_name, session = %session, remaining, "Left");
        Ok(remaining)
    }

    /// Forget a session and remove it from every room it was in.
    ///
    /// Returns each room the session left with the members remaining in it.
    pub fn disconnect(&self, session: &SessionId) -> Vec<(RoomId, usize)> {
        let left = match self.sessions.remove(session) {
            Some((_, entry)) => self.remove_memberships(session, entry.rooms),
            None => Vec::new(),
        };
        debug!(session = %session, rooms = left.len(), "Session disconnected");
        left
    }

    fn remove_memberships(&self, session: &SessionId, rooms: HashSet<RoomId>) -> Vec<(RoomId, usize)> {
        rooms
            .into_iter()
            .map(|room| {
                let remaining = self.remove_from_room(session, &room);
                (room, remaining)
            })
            .collect()
    }

    fn remove_from_room(&self, session: &SessionId, room_name: &str) -> usize {
        let remaining = match self.rooms.get_mut(room_name) {
            Some(mut room) => {
                room.leave(session);
                room.member_count()
            }
            None => return 0,
        };

        if remaining == 0
            && self.config.prune_empty_rooms
            && self.rooms.remove_if(room_name, |_, room| room.is_empty()).is_some()
        {
            debug!(room = %room_name, "Deleted empty room");
        }

        remaining
    }

    /// Send an event to every member of a room except `sender`.
    ///
    /// Returns the number of members that received it.
    pub fn broadcast_except(&self, room_name: &str, sender: &SessionId, event: ServerEvent) -> usize {
        let delivery = Delivery::new(event)
            .in_room(room_name)
            .with_source(sender.clone());
        self.deliver(room_name, &delivery, Some(sender))
    }

    /// Send an event to every member of a room.
    ///
    /// Returns the number of members that received it.
    pub fn emit_to_room(&self, room_name: &str, event: ServerEvent) -> usize {
        let delivery = Delivery::new(event).in_room(room_name);
        self.deliver(room_name, &delivery, None)
    }

    /// Route a prepared delivery to a room.
    pub fn deliver(&self, room_name: &str, delivery: &Delivery, except: Option<&SessionId>) -> usize {
        match self.rooms.get(room_name) {
            Some(room) => {
                let count = room.deliver(delivery, except);
                trace!(room = %room_name, recipients = count, "Delivered");
                count
            }
            None => {
                trace!(room = %room_name, "Delivery to room without members");
                0
            }
        }
    }

    /// Send an event to a single session.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is not connected.
    pub fn emit(&self, session: &SessionId, event: ServerEvent) -> Result<(), RegistryError> {
        let entry = self
            .sessions
            .get(session)
            .ok_or_else(|| RegistryError::UnknownSession(session.clone()))?;
        entry
            .outbox
            .send(Delivery::new(event))
            .map_err(|_| RegistryError::UnknownSession(session.clone()))
    }

    /// Check if a room exists.
    #[must_use]
    pub fn room_exists(&self, room_name: &str) -> bool {
        self.rooms.contains_key(room_name)
    }

    /// Get the member count of a room.
    #[must_use]
    pub fn member_count(&self, room_name: &str) -> usize {
        self.rooms
            .get(room_name)
            .map(|r| r.member_count())
            .unwrap_or(0)
    }

    /// Get the rooms a session is in.
    #[must_use]
    pub fn session_rooms(&self, session: &SessionId) -> Vec<String> {
        self.sessions
            .get(session)
            .map(|s| s.rooms.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry statistics.
#[derive(Debug, Clone)]
pub struct RegistryStats {
    /// Number of rooms with members.
    pub room_count: usize,
    /// Number of connected sessions.
    pub session_count: usize,
    /// Total room memberships across sessions.
    pub total_memberships: usize,
}
