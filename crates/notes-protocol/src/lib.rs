//! # studynotes-protocol
//!
//! Wire protocol for the Study Notes live editor.
//!
//! Editors and the server exchange small event envelopes over WebSocket,
//! either as JSON text frames or MessagePack binary frames.
//!
//! ## Events
//!
//! - `join` / `leave` - Room membership
//! - `live_update` - Full-content edit from an editor
//! - `remote_update` - Committed content relayed to the other room members
//! - `user_joined` / `user_left` / `cursor_moved` - Awareness
//!
//! ## Example
//!
//! ```rust
//! use studynotes_protocol::{codec, room_for, ClientEvent, NoteId};
//!
//! let note = NoteId::from(42u64);
//! let event = ClientEvent::live_update(room_for(Some(&note)), "<p>Hi</p>", Some(note));
//!
//! let text = codec::encode_text(&event).unwrap();
//! let decoded: ClientEvent = codec::decode_text(&text).unwrap();
//! assert_eq!(event, decoded);
//! ```

pub mod codec;
pub mod events;
pub mod room;
pub mod version;

pub use codec::{Encoding, ProtocolError, WireFrame};
pub use events::{codes, ClientEvent, ServerEvent};
pub use room::{note_id_from_room, room_for, NoteId, DEFAULT_ROOM, NOTE_ROOM_PREFIX};
pub use version::{Version, PROTOCOL_VERSION};
