use super::{
    slug_base, slug_candidate, sort_recent_first, DocumentStore, LiveDocument, StoreResult,
};
use crate::message::now_millis;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use studynotes_protocol::NoteId;
use tracing::trace;

/// In-process document store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: DashMap<NoteId, LiveDocument>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// Whether the store holds no documents.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, note_id: &NoteId) -> StoreResult<Option<LiveDocument>> {
        Ok(self.docs.get(note_id).map(|d| d.clone()))
    }

    async fn view(&self, note_id: &NoteId) -> StoreResult<Option<LiveDocument>> {
        Ok(self.docs.get_mut(note_id).map(|mut doc| {
            doc.view_count += 1;
            doc.value().clone()
        }))
    }

    async fn create(&self, title: &str, content: &str) -> StoreResult<LiveDocument> {
        let base = slug_base(title);
        let mut attempt = 0;
        loop {
            match self.docs.entry(slug_candidate(&base, attempt)) {
                Entry::Occupied(_) => attempt += 1,
                Entry::Vacant(slot) => {
                    let doc = LiveDocument::fresh(
                        slot.key().clone(),
                        title.trim().to_string(),
                        content,
                        now_millis(),
                    );
                    slot.insert(doc.clone());
                    trace!(note = %doc.note_id, "Created document");
                    return Ok(doc);
                }
            }
        }
    }

    async fn set(&self, note_id: &NoteId, content: &str) -> StoreResult<LiveDocument> {
        let now = now_millis();
        let doc = self
            .docs
            .entry(note_id.clone())
            .and_modify(|doc| {
                doc.content = content.to_string();
                doc.updated_at = now;
            })
            .or_insert_with(|| {
                LiveDocument::fresh(note_id.clone(), note_id.to_string(), content, now)
            })
            .value()
            .clone();
        trace!(note = %note_id, bytes = content.len(), "Stored document");
        Ok(doc)
    }

    async fn rename(&self, note_id: &NoteId, title: &str) -> StoreResult<Option<LiveDocument>> {
        Ok(self.docs.get_mut(note_id).map(|mut doc| {
            doc.title = title.to_string();
            doc.updated_at = now_millis();
            doc.value().clone()
        }))
    }

    async fn list(&self) -> StoreResult<Vec<LiveDocument>> {
        let mut docs: Vec<LiveDocument> = self.docs.iter().map(|d| d.clone()).collect();
        sort_recent_first(&mut docs);
        Ok(docs)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
