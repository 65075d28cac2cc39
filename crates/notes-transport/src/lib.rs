//! # studynotes-transport
//!
//! Client side of the Study Notes live protocol.
//!
//! - **Connection** - Send client events, receive server events
//! - **WebSocket** - The connection editors use in practice
//! - **LiveSession** - Handshake, debounced edits and remote updates for one room
//!
//! ## Example
//!
//! ```rust,ignore
//! use studynotes_transport::LiveSession;
//!
//! async fn edit(url: &str) -> Result<(), studynotes_transport::TransportError> {
//!     let mut session = LiveSession::connect(url, Some(42.into()), String::new()).await?;
//!     session.edit("<p>Draft</p>")?;
//!     session.close().await?;
//!     Ok(())
//! }
//! ```

pub mod session;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use session::{LiveSession, HANDSHAKE_TIMEOUT};
pub use traits::{Connection, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketConnection};
