//! # studynotes-server
//!
//! Live collaboration server for Study Notes: WebSocket rooms for editors
//! and a small REST surface over the live documents.

pub mod api;
pub mod config;
pub mod handlers;
pub mod metrics;

pub use config::Config;
pub use handlers::{build_router, run_server, serve, AppState};
