//! REST access to live documents.
//!
//! - `GET /api/live-notes`
//! - `POST /api/live-notes`
//! - `GET /api/live-notes/:note_id` (counts a view)
//! - `PUT /api/live-notes/:note_id`

use crate::handlers::AppState;
use crate::metrics;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use studynotes_core::{validate_title, LiveDocument, StoreError, SyncError};
use studynotes_protocol::{room_for, NoteId};
use tracing::{debug, error};

/// Routes under `/api/live-notes`.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/live-notes", get(list_notes).post(create_note))
        .route("/api/live-notes/:note_id", get(get_note).put(put_note))
}

/// A document together with who is editing it right now.
#[derive(Debug, Serialize)]
pub struct NoteView {
    #[serde(flatten)]
    pub document: LiveDocument,
    /// Sessions in the note's room.
    pub active_editors: usize,
}

/// Body of `POST /api/live-notes`.
#[derive(Debug, Deserialize)]
pub struct NewNote {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

/// Body of `PUT /api/live-notes/:note_id`. Absent fields are left alone.
#[derive(Debug, Deserialize)]
pub struct UpdateNote {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

/// Errors returned by the REST routes.
#[derive(Debug)]
pub enum ApiError {
    NotFound(NoteId),
    BadRequest(String),
    Store(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        error!(error = %err, "Document store failed");
        ApiError::Store(err.to_string())
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::InvalidRoom(reason) => ApiError::BadRequest(reason.to_string()),
            e @ SyncError::Persist { .. } => {
                metrics::record_persist_failure();
                error!(error = %e, "Update rejected");
                ApiError::Store(e.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(id) => (StatusCode::NOT_FOUND, format!("Note {} not found", id)),
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Store(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

async fn list_notes(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<LiveDocument>>, ApiError> {
    Ok(Json(state.sync.store().list().await?))
}

fn note_view(state: &AppState, document: LiveDocument) -> NoteView {
    let active_editors = state
        .registry
        .member_count(&room_for(Some(&document.note_id)));
    NoteView {
        document,
        active_editors,
    }
}

async fn create_note(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewNote>,
) -> Result<(StatusCode, Json<NoteView>), ApiError> {
    let title = body.title.unwrap_or_default();
    validate_title(&title).map_err(|reason| ApiError::BadRequest(reason.to_string()))?;

    let document = state
        .sync
        .store()
        .create(&title, body.content.as_deref().unwrap_or_default())
        .await?;
    debug!(note = %document.note_id, "Created note over REST");

    Ok((StatusCode::CREATED, Json(note_view(&state, document))))
}

async fn get_note(
    State(state): State<Arc<AppState>>,
    Path(note_id): Path<String>,
) -> Result<Json<NoteView>, ApiError> {
    let note_id = NoteId::new(note_id);
    let document = state
        .sync
        .store()
        .view(&note_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(note_id.clone()))?;

    Ok(Json(note_view(&state, document)))
}

async fn put_note(
    State(state): State<Arc<AppState>>,
    Path(note_id): Path<String>,
    Json(body): Json<UpdateNote>,
) -> Result<Json<NoteView>, ApiError> {
    let note_id = NoteId::new(note_id);
    if let Some(title) = &body.title {
        validate_title(title).map_err(|reason| ApiError::BadRequest(reason.to_string()))?;
    }
    let mut document = state
        .sync
        .document(&note_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(note_id.clone()))?;

    if let Some(content) = body.content {
        let room = room_for(Some(&note_id));
        let outcome = state
            .sync
            .publish(&room, Some(note_id.clone()), content)
            .await?;
        metrics::record_update(outcome.recipients);
        debug!(room = %room, recipients = outcome.recipients, "Published over REST");
        document = outcome.document;
    }

    if let Some(title) = body.title {
        document = state
            .sync
            .store()
            .rename(&note_id, title.trim())
            .await?
            .ok_or_else(|| ApiError::NotFound(note_id.clone()))?;
    }

    Ok(Json(note_view(&state, document)))
}
