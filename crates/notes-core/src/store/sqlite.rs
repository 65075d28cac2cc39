use super::{
    slug_base, slug_candidate, sort_recent_first, DocumentStore, LiveDocument, StoreError,
    StoreResult,
};
use crate::message::now_millis;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use studynotes_protocol::NoteId;
use tracing::{debug, info};

/// Schema migrations, applied in order and mirrored to `PRAGMA user_version`.
const MIGRATIONS: &[(u32, &str)] = &[
    (
        1,
        "CREATE TABLE IF NOT EXISTS live_notes (
            note_id    TEXT PRIMARY KEY NOT NULL,
            content    TEXT NOT NULL DEFAULT '',
            updated_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS live_notes_updated_at ON live_notes(updated_at);",
    ),
    (
        2,
        "ALTER TABLE live_notes ADD COLUMN title TEXT NOT NULL DEFAULT '';
        ALTER TABLE live_notes ADD COLUMN view_count INTEGER NOT NULL DEFAULT 0;
        ALTER TABLE live_notes ADD COLUMN created_at INTEGER NOT NULL DEFAULT 0;
        UPDATE live_notes SET title = note_id WHERE title = '';
        UPDATE live_notes SET created_at = updated_at WHERE created_at = 0;",
    ),
];

fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |(version, _)| *version)
}

fn apply_migrations(conn: &mut Connection) -> StoreResult<()> {
    let current: u32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    let latest = latest_version();

    if current > latest {
        return Err(StoreError::UnsupportedSchema {
            found: current,
            supported: latest,
        });
    }
    if current == latest {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for (version, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }
        tx.execute_batch(sql)?;
        tx.execute_batch(&format!("PRAGMA user_version = {};", version))?;
    }
    tx.commit()?;
    Ok(())
}

/// SQLite-backed document store.
///
/// Queries run on tokio's blocking pool behind one shared connection.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database file and migrate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or migrated.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let started_at = Instant::now();
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        let store = Self::bootstrap(conn)?;
        info!(
            path = %path.display(),
            duration_ms = started_at.elapsed().as_millis() as u64,
            "Opened SQLite document store"
        );
        Ok(store)
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(mut conn: Connection) -> StoreResult<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        apply_migrations(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("connection lock poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("blocking task failed: {e}")))?
    }
}

fn read_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<LiveDocument> {
    Ok(LiveDocument {
        note_id: NoteId::new(row.get::<_, String>(0)?),
        title: row.get(1)?,
        content: row.get(2)?,
        view_count: row.get::<_, i64>(3)?.max(0) as u64,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn get(&self, note_id: &NoteId) -> StoreResult<Option<LiveDocument>> {
        let id = note_id.to_string();
        self.with_conn(move |conn| {
            let doc = conn
                .query_row(
                    "SELECT note_id, title, content, view_count, created_at, updated_at
                     FROM live_notes WHERE note_id = ?1;",
                    params![id],
                    read_document,
                )
                .optional()?;
            Ok(doc)
        })
        .await
    }

    async fn view(&self, note_id: &NoteId) -> StoreResult<Option<LiveDocument>> {
        let id = note_id.to_string();
        self.with_conn(move |conn| {
            let doc = conn
                .query_row(
                    "UPDATE live_notes SET view_count = view_count + 1 WHERE note_id = ?1
                     RETURNING note_id, title, content, view_count, created_at, updated_at;",
                    params![id],
                    read_document,
                )
                .optional()?;
            Ok(doc)
        })
        .await
    }

    async fn create(&self, title: &str, content: &str) -> StoreResult<LiveDocument> {
        let base = slug_base(title);
        let title = title.trim().to_string();
        let content = content.to_string();
        let now = now_millis();
        let doc = self
            .with_conn(move |conn| {
                let mut attempt = 0;
                loop {
                    let candidate = slug_candidate(&base, attempt);
                    let inserted = conn
                        .query_row(
                            "INSERT INTO live_notes
                                (note_id, title, content, view_count, created_at, updated_at)
                             VALUES (?1, ?2, ?3, 0, ?4, ?4)
                             ON CONFLICT(note_id) DO NOTHING
                             RETURNING note_id, title, content, view_count, created_at, updated_at;",
                            params![candidate.as_str(), title, content, now],
                            read_document,
                        )
                        .optional()?;
                    match inserted {
                        Some(doc) => return Ok(doc),
                        None => attempt += 1,
                    }
                }
            })
            .await?;
        debug!(note = %doc.note_id, "Created document");
        Ok(doc)
    }

    async fn set(&self, note_id: &NoteId, content: &str) -> StoreResult<LiveDocument> {
        let id = note_id.to_string();
        let body = content.to_string();
        let now = now_millis();
        let doc = self
            .with_conn(move |conn| {
                let doc = conn.query_row(
                    "INSERT INTO live_notes
                        (note_id, title, content, view_count, created_at, updated_at)
                     VALUES (?1, ?1, ?2, 0, ?3, ?3)
                     ON CONFLICT(note_id) DO UPDATE SET
                        content = excluded.content,
                        updated_at = excluded.updated_at
                     RETURNING note_id, title, content, view_count, created_at, updated_at;",
                    params![id, body, now],
                    read_document,
                )?;
                Ok(doc)
            })
            .await?;
        debug!(note = %note_id, bytes = content.len(), "Persisted document");
        Ok(doc)
    }

    async fn rename(&self, note_id: &NoteId, title: &str) -> StoreResult<Option<LiveDocument>> {
        let id = note_id.to_string();
        let title = title.to_string();
        let now = now_millis();
        self.with_conn(move |conn| {
            let doc = conn
                .query_row(
                    "UPDATE live_notes SET title = ?2, updated_at = ?3 WHERE note_id = ?1
                     RETURNING note_id, title, content, view_count, created_at, updated_at;",
                    params![id, title, now],
                    read_document,
                )
                .optional()?;
            Ok(doc)
        })
        .await
    }

    async fn list(&self) -> StoreResult<Vec<LiveDocument>> {
        let mut docs = self
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT note_id, title, content, view_count, created_at, updated_at
                     FROM live_notes;",
                )?;
                let docs = stmt
                    .query_map([], read_document)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(docs)
            })
            .await?;
        sort_recent_first(&mut docs);
        Ok(docs)
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_set_get() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = NoteId::new("1");

        assert!(store.get(&id).await.unwrap().is_none());
        store.set(&id, "Hello").await.unwrap();
        let committed = store.set(&id, "Hello World").await.unwrap();

        let loaded = store.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded, committed);
        assert_eq!(loaded.content, "Hello World");
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.set(&NoteId::new("7"), "<p>kept</p>").await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let doc = store.get(&NoteId::new("7")).await.unwrap().unwrap();
        assert_eq!(doc.content, "<p>kept</p>");
    }

    #[tokio::test]
    async fn test_sqlite_create_view_rename() {
        let store = SqliteStore::open_in_memory().unwrap();

        let first = store.create("Linear Algebra", "<p>1</p>").await.unwrap();
        let second = store.create("linear algebra", "").await.unwrap();
        assert_eq!(first.note_id, NoteId::new("linear-algebra"));
        assert_eq!(second.note_id, NoteId::new("linear-algebra-1"));
        assert_eq!(first.view_count, 0);

        store.view(&first.note_id).await.unwrap();
        let viewed = store.view(&first.note_id).await.unwrap().unwrap();
        assert_eq!(viewed.view_count, 2);

        let edited = store.set(&first.note_id, "<p>2</p>").await.unwrap();
        assert_eq!(edited.title, "Linear Algebra");
        assert_eq!(edited.view_count, 2);
        assert_eq!(edited.created_at, first.created_at);

        let renamed = store
            .rename(&first.note_id, "Matrices")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(renamed.title, "Matrices");
        assert_eq!(renamed.content, "<p>2</p>");
        assert!(store.view(&NoteId::new("missing")).await.unwrap().is_none());
        assert!(store.rename(&NoteId::new("missing"), "x").await.unwrap().is_none());
    }

    #[test]
    fn test_migrates_version_one_database() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(MIGRATIONS[0].1).unwrap();
        conn.execute_batch("PRAGMA user_version = 1;").unwrap();
        conn.execute(
            "INSERT INTO live_notes (note_id, content, updated_at) VALUES ('4', 'old', 1234);",
            [],
        )
        .unwrap();

        apply_migrations(&mut conn).unwrap();
        let doc = conn
            .query_row(
                "SELECT note_id, title, content, view_count, created_at, updated_at
                 FROM live_notes;",
                [],
                read_document,
            )
            .unwrap();
        assert_eq!(doc.title, "4");
        assert_eq!(doc.content, "old");
        assert_eq!(doc.view_count, 0);
        assert_eq!(doc.created_at, 1234);
    }

    #[test]
    fn test_rejects_newer_schema() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA user_version = 99;").unwrap();
        assert!(matches!(
            apply_migrations(&mut conn),
            Err(StoreError::UnsupportedSchema { found: 99, .. })
        ));
    }
}
