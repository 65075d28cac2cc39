//! Room naming for live documents.
//!
//! The page that hosts the editor derives the room from the note it renders:
//! `note-<id>` for a concrete note, or a fixed default room when the editor is
//! opened without one. Paired clients depend on this exact convention.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Room used when the editor is opened without a note.
pub const DEFAULT_ROOM: &str = "live-default";

/// Prefix of every note-backed room.
pub const NOTE_ROOM_PREFIX: &str = "note-";

/// Identifier of a live document.
///
/// Clients may send it as a JSON string or an integer; both are normalized to
/// their string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "RawNoteId", into = "String")]
pub struct NoteId(String);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawNoteId {
    Number(i64),
    Text(String),
}

impl From<RawNoteId> for NoteId {
    fn from(raw: RawNoteId) -> Self {
        match raw {
            RawNoteId::Number(n) => Self(n.to_string()),
            RawNoteId::Text(s) => Self(s),
        }
    }
}

impl NoteId {
    /// Create a note id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<NoteId> for String {
    fn from(id: NoteId) -> String {
        id.0
    }
}

impl From<&str> for NoteId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NoteId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<u64> for NoteId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

/// Derive the room for a note, or the default room when there is none.
#[must_use]
pub fn room_for(note_id: Option<&NoteId>) -> String {
    match note_id {
        Some(id) => format!("{NOTE_ROOM_PREFIX}{id}"),
        None => DEFAULT_ROOM.to_string(),
    }
}

/// Recover the note id from a `note-<id>` room name.
#[must_use]
pub fn note_id_from_room(room: &str) -> Option<NoteId> {
    room.strip_prefix(NOTE_ROOM_PREFIX)
        .filter(|id| !id.is_empty())
        .map(NoteId::new)
}
