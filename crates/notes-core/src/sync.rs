//! Live document synchronizer.
//!
//! Every accepted edit is persisted as the document's new content and then
//! relayed to the other members of its room. Edits to the same room are
//! applied one at a time in arrival order, and so are edits to the same
//! document, whichever room they arrive through; the last one applied wins.
//! Unrelated rooms never wait on each other.
//!
//! An edit takes its room's lock first and then its document's lock. Every
//! edit holds at most one of each, always in that order.

use crate::message::Delivery;
use crate::registry::RoomRegistry;
use crate::room::{validate_room_name, RoomId};
use crate::session::SessionId;
use crate::store::{DocumentStore, LiveDocument, StoreError};
use dashmap::DashMap;
use std::sync::Arc;
use studynotes_protocol::{note_id_from_room, NoteId, ServerEvent};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Synchronizer errors.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Invalid room name.
    #[error("Invalid room name: {0}")]
    InvalidRoom(&'static str),

    /// The update could not be stored and was not broadcast.
    #[error("Failed to persist note {note_id}: {source}")]
    Persist {
        /// Document that failed to persist.
        note_id: NoteId,
        /// Underlying store error.
        #[source]
        source: StoreError,
    },
}

/// Result of an applied update.
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    /// The document as committed.
    pub document: LiveDocument,
    /// Sessions the committed content was relayed to.
    pub recipients: usize,
}

/// Resolve which document an update in `room` writes to.
///
/// An explicit note id wins; otherwise a `note-<id>` room names its note,
/// and any other room (the default room included) is its own document.
#[must_use]
pub fn document_key(room: &str, note_id: Option<&NoteId>) -> NoteId {
    note_id
        .cloned()
        .or_else(|| note_id_from_room(room))
        .unwrap_or_else(|| NoteId::new(room))
}

/// Persists edits and relays them to room members.
pub struct Synchronizer {
    registry: Arc<RoomRegistry>,
    store: Arc<dyn DocumentStore>,
    /// One FIFO lock per room with an update in flight.
    room_locks: DashMap<RoomId, Arc<Mutex<()>>>,
    /// One FIFO lock per document with an update in flight.
    document_locks: DashMap<NoteId, Arc<Mutex<()>>>,
}

impl Synchronizer {
    /// Create a synchronizer over a registry and a store.
    #[must_use]
    pub fn new(registry: Arc<RoomRegistry>, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            registry,
            store,
            room_locks: DashMap::new(),
            document_locks: DashMap::new(),
        }
    }

    /// The registry updates are routed through.
    #[must_use]
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// The backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Apply an edit from a session.
    ///
    /// The content overwrites the document unconditionally. Only once the
    /// write has committed is it relayed, as `remote_update`, to every other
    /// member of `room`. The sender never receives its own update.
    ///
    /// # Errors
    ///
    /// Returns an error if the room name is invalid or the write fails. A
    /// failed write is never broadcast.
    pub async fn handle_update(
        &self,
        sender: &SessionId,
        room: &str,
        note_id: Option<NoteId>,
        content: String,
    ) -> Result<UpdateOutcome, SyncError> {
        self.apply(Some(sender), room, note_id, content).await
    }

    /// Apply an edit that did not come from a room member.
    ///
    /// Same as [`handle_update`](Self::handle_update), but every member of
    /// the room receives the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the room name is invalid or the write fails.
    pub async fn publish(
        &self,
        room: &str,
        note_id: Option<NoteId>,
        content: String,
    ) -> Result<UpdateOutcome, SyncError> {
        self.apply(None, room, note_id, content).await
    }

    /// Load the current content of a document.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub async fn document(&self, note_id: &NoteId) -> Result<Option<LiveDocument>, StoreError> {
        self.store.get(note_id).await
    }

    /// Number of rooms with an update in flight or queued.
    #[must_use]
    pub fn busy_rooms(&self) -> usize {
        self.room_locks.len()
    }

    /// Number of documents with an update in flight or queued.
    #[must_use]
    pub fn busy_documents(&self) -> usize {
        self.document_locks.len()
    }

    async fn apply(
        &self,
        sender: Option<&SessionId>,
        room: &str,
        note_id: Option<NoteId>,
        content: String,
    ) -> Result<UpdateOutcome, SyncError> {
        validate_room_name(room).map_err(SyncError::InvalidRoom)?;
        let key = document_key(room, note_id.as_ref());

        let room_lock = self.room_lock(room);
        let document_lock = self.document_lock(&key);
        let result = {
            let _room = room_lock.lock().await;
            let _document = document_lock.lock().await;
            self.persist_and_relay(sender, room, key.clone(), &content).await
        };
        drop(room_lock);
        drop(document_lock);
        self.release_room_lock(room);
        self.release_document_lock(&key);

        result
    }

    async fn persist_and_relay(
        &self,
        sender: Option<&SessionId>,
        room: &str,
        key: NoteId,
        content: &str,
    ) -> Result<UpdateOutcome, SyncError> {
        let document = match self.store.set(&key, content).await {
            Ok(document) => document,
            Err(source) => {
                warn!(
                    room = %room,
                    note = %key,
                    store = self.store.name(),
                    error = %source,
                    "Update not persisted, dropping broadcast"
                );
                return Err(SyncError::Persist {
                    note_id: key,
                    source,
                });
            }
        };

        let mut delivery =
            Delivery::new(ServerEvent::remote_update(document.content.clone())).in_room(room);
        if let Some(sender) = sender {
            delivery = delivery.with_source(sender.clone());
        }
        let recipients = self.registry.deliver(room, &delivery, sender);

        debug!(
            room = %room,
            note = %key,
            bytes = document.content.len(),
            recipients,
            "Update committed and relayed"
        );

        Ok(UpdateOutcome {
            document,
            recipients,
        })
    }

    fn room_lock(&self, room: &str) -> Arc<Mutex<()>> {
        Arc::clone(&self.room_locks.entry(room.to_string()).or_default())
    }

    fn release_room_lock(&self, room: &str) {
        self.room_locks
            .remove_if(room, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn document_lock(&self, key: &NoteId) -> Arc<Mutex<()>> {
        Arc::clone(&self.document_locks.entry(key.clone()).or_default())
    }

    fn release_document_lock(&self, key: &NoteId) {
        self.document_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::SessionReceiver;
    use crate::store::{MemoryStore, StoreResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use studynotes_protocol::DEFAULT_ROOM;
    use tokio::sync::Notify;

    fn setup_with(store: Arc<dyn DocumentStore>) -> (Arc<RoomRegistry>, Synchronizer) {
        let registry = Arc::new(RoomRegistry::new());
        let sync = Synchronizer::new(Arc::clone(&registry), store);
        (registry, sync)
    }

    fn setup() -> (Arc<RoomRegistry>, Arc<MemoryStore>, Synchronizer) {
        let store = Arc::new(MemoryStore::new());
        let (registry, sync) = setup_with(store.clone());
        (registry, store, sync)
    }

    fn member(registry: &RoomRegistry, id: &str, room: &str) -> (SessionId, SessionReceiver) {
        let session = SessionId::new(id);
        let rx = registry.connect(session.clone());
        registry.join(&session, room).unwrap();
        (session, rx)
    }

    fn drain(rx: &mut SessionReceiver) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(delivery) = rx.try_recv() {
            events.push(delivery.event().clone());
        }
        events
    }

    /// Fails every write while `failing` is set.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        failing: AtomicBool,
    }

    #[async_trait]
    impl DocumentStore for FlakyStore {
        async fn get(&self, note_id: &NoteId) -> StoreResult<Option<LiveDocument>> {
            self.inner.get(note_id).await
        }

        async fn set(&self, note_id: &NoteId, content: &str) -> StoreResult<LiveDocument> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("disk on fire".into()));
            }
            self.inner.set(note_id, content).await
        }

        async fn view(&self, note_id: &NoteId) -> StoreResult<Option<LiveDocument>> {
            self.inner.view(note_id).await
        }

        async fn create(&self, title: &str, content: &str) -> StoreResult<LiveDocument> {
            self.inner.create(title, content).await
        }

        async fn rename(&self, note_id: &NoteId, title: &str) -> StoreResult<Option<LiveDocument>> {
            self.inner.rename(note_id, title).await
        }

        async fn list(&self) -> StoreResult<Vec<LiveDocument>> {
            self.inner.list().await
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    /// Holds writes to one note until released.
    struct GatedStore {
        inner: MemoryStore,
        gated: NoteId,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl DocumentStore for GatedStore {
        async fn get(&self, note_id: &NoteId) -> StoreResult<Option<LiveDocument>> {
            self.inner.get(note_id).await
        }

        async fn set(&self, note_id: &NoteId, content: &str) -> StoreResult<LiveDocument> {
            if note_id == &self.gated {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.set(note_id, content).await
        }

        async fn view(&self, note_id: &NoteId) -> StoreResult<Option<LiveDocument>> {
            self.inner.view(note_id).await
        }

        async fn create(&self, title: &str, content: &str) -> StoreResult<LiveDocument> {
            self.inner.create(title, content).await
        }

        async fn rename(&self, note_id: &NoteId, title: &str) -> StoreResult<Option<LiveDocument>> {
            self.inner.rename(note_id, title).await
        }

        async fn list(&self) -> StoreResult<Vec<LiveDocument>> {
            self.inner.list().await
        }

        fn name(&self) -> &'static str {
            "gated"
        }
    }

    #[test]
    fn test_document_key() {
        assert_eq!(document_key("note-5", None), NoteId::new("5"));
        assert_eq!(document_key("note-5", Some(&NoteId::new("9"))), NoteId::new("9"));
        assert_eq!(document_key(DEFAULT_ROOM, None), NoteId::new(DEFAULT_ROOM));
    }

    #[tokio::test]
    async fn test_two_editors_scenario() {
        let (registry, store, sync) = setup();
        let (a, mut rx_a) = member(&registry, "a", "note-1");
        let (b, mut rx_b) = member(&registry, "b", "note-1");
        let note = NoteId::new("1");

        let outcome = sync
            .handle_update(&a, "note-1", Some(note.clone()), "Hello".into())
            .await
            .unwrap();
        assert_eq!(outcome.recipients, 1);
        assert_eq!(drain(&mut rx_b), vec![ServerEvent::remote_update("Hello")]);
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(store.get(&note).await.unwrap().unwrap().content, "Hello");

        sync.handle_update(&b, "note-1", Some(note.clone()), "Hello World".into())
            .await
            .unwrap();
        assert_eq!(drain(&mut rx_a), vec![ServerEvent::remote_update("Hello World")]);
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(store.get(&note).await.unwrap().unwrap().content, "Hello World");
    }

    #[tokio::test]
    async fn test_persist_failure_is_not_broadcast() {
        let store = Arc::new(FlakyStore::default());
        let (registry, sync) = setup_with(store.clone());
        let (a, _rx_a) = member(&registry, "a", "note-1");
        let (_b, mut rx_b) = member(&registry, "b", "note-1");

        sync.handle_update(&a, "note-1", None, "first".into())
            .await
            .unwrap();
        drain(&mut rx_b);

        store.failing.store(true, Ordering::SeqCst);
        let err = sync
            .handle_update(&a, "note-1", None, "lost".into())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Persist { .. }));
        assert!(drain(&mut rx_b).is_empty());

        let stored = store.get(&NoteId::new("1")).await.unwrap().unwrap();
        assert_eq!(stored.content, "first");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_last_writer_wins() {
        let (registry, store, sync) = setup();
        let sync = Arc::new(sync);
        let (_observer, mut rx_observer) = member(&registry, "observer", "note-1");

        let writers: Vec<(SessionId, SessionReceiver)> = (0..4)
            .map(|i| member(&registry, &format!("w{}", i), "note-1"))
            .collect();
        let ids: Vec<SessionId> = writers.iter().map(|(id, _)| id.clone()).collect();

        let mut handles = Vec::new();
        for (w, id) in ids.iter().enumerate() {
            let sync = Arc::clone(&sync);
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                for n in 0..25 {
                    sync.handle_update(&id, "note-1", None, format!("w{}-{}", w, n))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let seen = drain(&mut rx_observer);
        assert_eq!(seen.len(), 100);

        let stored = store.get(&NoteId::new("1")).await.unwrap().unwrap();
        assert_eq!(seen.last(), Some(&ServerEvent::remote_update(stored.content)));

        for (w, (_, mut rx)) in writers.into_iter().enumerate() {
            let received = drain(&mut rx);
            assert_eq!(received.len(), 75);
            let own = format!("w{}-", w);
            assert!(received.iter().all(|e| match e {
                ServerEvent::RemoteUpdate { content } => !content.starts_with(&own),
                _ => false,
            }));
        }

        assert_eq!(sync.busy_rooms(), 0);
        assert_eq!(sync.busy_documents(), 0);
    }

    #[tokio::test]
    async fn test_rooms_do_not_block_each_other() {
        let store = Arc::new(GatedStore {
            inner: MemoryStore::new(),
            gated: NoteId::new("42"),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let (registry, sync) = setup_with(store.clone());
        let sync = Arc::new(sync);
        let (a, _rx_a) = member(&registry, "a", "note-42");
        let (b, _rx_b) = member(&registry, "b", "note-43");
        let (_c, mut rx_c) = member(&registry, "c", "note-43");

        let slow = {
            let sync = Arc::clone(&sync);
            tokio::spawn(async move {
                sync.handle_update(&a, "note-42", None, "slow".into()).await
            })
        };
        store.entered.notified().await;

        tokio::time::timeout(
            Duration::from_secs(1),
            sync.handle_update(&b, "note-43", None, "fast".into()),
        )
        .await
        .expect("note-43 waited on note-42")
        .unwrap();
        assert_eq!(drain(&mut rx_c), vec![ServerEvent::remote_update("fast")]);

        store.release.notify_one();
        slow.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_same_note_from_two_rooms_is_serialized() {
        let store = Arc::new(GatedStore {
            inner: MemoryStore::new(),
            gated: NoteId::new("7"),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let (registry, sync) = setup_with(store.clone());
        let sync = Arc::new(sync);
        let (a, _rx_a) = member(&registry, "a", "note-7");
        let (b, _rx_b) = member(&registry, "b", DEFAULT_ROOM);

        let first = {
            let sync = Arc::clone(&sync);
            tokio::spawn(async move {
                sync.handle_update(&a, "note-7", None, "first".into()).await
            })
        };
        store.entered.notified().await;

        let second = {
            let sync = Arc::clone(&sync);
            tokio::spawn(async move {
                sync.handle_update(&b, DEFAULT_ROOM, Some(NoteId::new("7")), "second".into())
                    .await
            })
        };
        assert!(
            tokio::time::timeout(Duration::from_millis(100), store.entered.notified())
                .await
                .is_err(),
            "second write reached the store while the first was in flight"
        );
        assert_eq!(sync.busy_rooms(), 2);
        assert_eq!(sync.busy_documents(), 1);

        store.release.notify_one();
        first.await.unwrap().unwrap();
        store.entered.notified().await;
        store.release.notify_one();
        second.await.unwrap().unwrap();

        let stored = store.get(&NoteId::new("7")).await.unwrap().unwrap();
        assert_eq!(stored.content, "second");
        assert_eq!(sync.busy_rooms(), 0);
        assert_eq!(sync.busy_documents(), 0);
    }

    #[tokio::test]
    async fn test_update_to_long_room_name_persists() {
        let (registry, store, sync) = setup();
        let room = format!("note-{}", "7".repeat(300));
        let (a, _rx_a) = member(&registry, "a", &room);
        let (_b, mut rx_b) = member(&registry, "b", &room);

        sync.handle_update(&a, &room, None, "long".into()).await.unwrap();
        assert_eq!(drain(&mut rx_b), vec![ServerEvent::remote_update("long")]);
        assert!(store.get(&NoteId::new("7".repeat(300))).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_default_room_behaves_like_named_room() {
        let (registry, store, sync) = setup();
        let (a, mut rx_a) = member(&registry, "a", DEFAULT_ROOM);
        let (_b, mut rx_b) = member(&registry, "b", DEFAULT_ROOM);

        sync.handle_update(&a, DEFAULT_ROOM, None, "scratch".into())
            .await
            .unwrap();

        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(drain(&mut rx_b), vec![ServerEvent::remote_update("scratch")]);
        let doc = store.get(&NoteId::new(DEFAULT_ROOM)).await.unwrap().unwrap();
        assert_eq!(doc.content, "scratch");
    }

    #[tokio::test]
    async fn test_publish_reaches_every_member() {
        let (registry, _store, sync) = setup();
        let (_a, mut rx_a) = member(&registry, "a", "note-3");
        let (_b, mut rx_b) = member(&registry, "b", "note-3");

        let outcome = sync.publish("note-3", None, "from rest".into()).await.unwrap();
        assert_eq!(outcome.recipients, 2);
        assert_eq!(drain(&mut rx_a).len(), 1);
        assert_eq!(drain(&mut rx_b).len(), 1);
    }

    #[tokio::test]
    async fn test_update_without_members_still_persists() {
        let (_registry, store, sync) = setup();
        let outcome = sync
            .handle_update(&SessionId::new("lonely"), "note-8", None, "solo".into())
            .await
            .unwrap();
        assert_eq!(outcome.recipients, 0);
        assert!(store.get(&NoteId::new("8")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalid_room_rejected() {
        let (_registry, store, sync) = setup();
        let err = sync
            .handle_update(&SessionId::new("a"), "", None, "x".into())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidRoom(_)));
        assert!(store.is_empty());
    }
}
