//! # studynotes-core
//!
//! Live collaboration core for the Study Notes editor.
//!
//! - **Registry** - Which sessions are in which room
//! - **Synchronizer** - Persist an edit, then relay it to the rest of the room
//! - **Debounce** - Coalesce keystrokes into one update per quiet period
//! - **Store** - Where documents live (memory or SQLite)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  live_update  ┌──────────────┐  set   ┌─────────────┐
//! │   Session   │──────────────▶│ Synchronizer │───────▶│    Store    │
//! └─────────────┘               └──────────────┘        └─────────────┘
//!        ▲                             │ remote_update
//!        │                             ▼
//!        │  per-session queue   ┌──────────────┐
//!        └──────────────────────│   Registry   │
//!                               └──────────────┘
//! ```

pub mod debounce;
pub mod message;
pub mod registry;
pub mod room;
pub mod session;
pub mod store;
pub mod sync;

pub use debounce::{
    DebouncedEmitter, EmitError, EmitterConfig, EmitterState, EmitterStats, UpdateSink,
    DEFAULT_QUIET_PERIOD,
};
pub use message::Delivery;
pub use registry::{JoinOutcome, RegistryConfig, RegistryError, RegistryStats, RoomRegistry};
pub use room::{Room, RoomId, SessionReceiver};
pub use session::SessionId;
pub use store::{validate_title, DocumentStore, LiveDocument, MemoryStore, SqliteStore, StoreError};
pub use sync::{document_key, SyncError, Synchronizer, UpdateOutcome};
