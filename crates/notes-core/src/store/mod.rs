//! Persistence for live documents.
//!
//! The synchronizer only needs `get`/`set`; the rest backs the live-notes
//! REST routes. Content writes are unconditional overwrites.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use studynotes_protocol::NoteId;
use thiserror::Error;

/// Maximum title length in characters.
pub const MAX_TITLE_LENGTH: usize = 200;

/// Base slug used when a title has no usable characters.
const UNTITLED_SLUG: &str = "untitled";

/// Persisted state of one live document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveDocument {
    /// Document identifier, also its URL slug.
    pub note_id: NoteId,
    /// Display title.
    pub title: String,
    /// Latest committed content.
    pub content: String,
    /// Reads through the REST routes.
    pub view_count: u64,
    /// Epoch milliseconds of creation.
    pub created_at: i64,
    /// Epoch milliseconds of the last write.
    pub updated_at: i64,
}

impl LiveDocument {
    /// A document that has just been written for the first time.
    pub(crate) fn fresh(note_id: NoteId, title: String, content: &str, now: i64) -> Self {
        Self {
            note_id,
            title,
            content: content.to_string(),
            view_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite failure.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The database was written by a newer schema.
    #[error("Unsupported schema version {found} (latest supported {supported})")]
    UnsupportedSchema {
        /// Version found in the database.
        found: u32,
        /// Latest version this build understands.
        supported: u32,
    },

    /// The store cannot be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Storage backend for live documents.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Load a document.
    async fn get(&self, note_id: &NoteId) -> StoreResult<Option<LiveDocument>>;

    /// Load a document on behalf of a reader, counting the view.
    async fn view(&self, note_id: &NoteId) -> StoreResult<Option<LiveDocument>>;

    /// Create a titled document under a fresh slug derived from the title.
    ///
    /// Taken slugs get a `-1`, `-2`, ... suffix until one is free.
    async fn create(&self, title: &str, content: &str) -> StoreResult<LiveDocument>;

    /// Overwrite a document's content, creating it if needed.
    ///
    /// A document created this way is titled after its id. Returns the
    /// document as committed.
    async fn set(&self, note_id: &NoteId, content: &str) -> StoreResult<LiveDocument>;

    /// Change a document's title. Returns `None` if it does not exist.
    async fn rename(&self, note_id: &NoteId, title: &str) -> StoreResult<Option<LiveDocument>>;

    /// List all documents, most recently updated first.
    async fn list(&self) -> StoreResult<Vec<LiveDocument>>;

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}

/// Check a title before it is stored.
///
/// # Errors
///
/// Returns an error message if the title is blank or too long.
pub fn validate_title(title: &str) -> Result<(), &'static str> {
    if title.trim().is_empty() {
        return Err("Title is required");
    }
    if title.chars().count() > MAX_TITLE_LENGTH {
        return Err("Title is too long");
    }
    Ok(())
}

/// Turn a title into a URL slug.
///
/// Lowercases, drops everything but letters, digits, `_`, `-` and
/// whitespace, then joins the remaining words with single dashes.
#[must_use]
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut separator = false;
    for c in title.to_lowercase().chars() {
        if c.is_alphanumeric() || c == '_' {
            if separator && !slug.is_empty() {
                slug.push('-');
            }
            separator = false;
            slug.push(c);
        } else if c == '-' || c.is_whitespace() {
            separator = true;
        }
    }
    slug
}

fn slug_base(title: &str) -> String {
    let slug = slugify(title);
    if slug.is_empty() {
        UNTITLED_SLUG.to_string()
    } else {
        slug
    }
}

fn slug_candidate(base: &str, attempt: u32) -> NoteId {
    match attempt {
        0 => NoteId::new(base),
        n => NoteId::new(format!("{}-{}", base, n)),
    }
}

fn sort_recent_first(docs: &mut [LiveDocument]) {
    docs.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| a.note_id.cmp(&b.note_id))
    });
}
