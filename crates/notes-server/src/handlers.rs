//! Connection handlers for the live notes server.
//!
//! This module handles the WebSocket session lifecycle and event dispatch.

use crate::api;
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use studynotes_core::{
    DocumentStore, RegistryConfig, RegistryError, RoomRegistry, SessionId, SyncError, Synchronizer,
};
use studynotes_protocol::{
    codec, codes, ClientEvent, Encoding, ServerEvent, WireFrame, PROTOCOL_VERSION,
};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Room membership.
    pub registry: Arc<RoomRegistry>,
    /// Persists and relays live updates.
    pub sync: Synchronizer,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state over a document store.
    #[must_use]
    pub fn new(config: Config, store: Arc<dyn DocumentStore>) -> Self {
        let registry = Arc::new(RoomRegistry::with_config(RegistryConfig {
            max_rooms_per_session: config.max_rooms_per_session(),
            prune_empty_rooms: true,
        }));

        Self {
            sync: Synchronizer::new(Arc::clone(&registry), store),
            registry,
            config,
        }
    }
}

/// Build the HTTP/WebSocket router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .merge(api::routes())
        .with_state(state)
}

/// Serve on an already bound listener until the server stops.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    let app = build_router(state);
    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config, store: Arc<dyn DocumentStore>) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!(store = store.name(), "Study Notes server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    serve(listener, Arc::new(AppState::new(config, store))).await
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.registry.stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION.to_string(),
        "sessions": stats.session_count,
        "rooms": stats.room_count,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket session.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let session = SessionId::generate();
    let mut outbox = state.registry.connect(session.clone());

    debug!(session = %session, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    // Replies go out in the encoding the client last used
    let mut encoding = Encoding::Json;

    let connected = ServerEvent::connected(
        session.as_str(),
        PROTOCOL_VERSION.major,
        u32::try_from(state.config.heartbeat.interval_ms).unwrap_or(u32::MAX),
    );

    if send_event(&mut sender, &connected, encoding).await.is_ok() {
        loop {
            tokio::select! {
                biased;

                // Room traffic queued for this session
                Some(delivery) = outbox.recv() => {
                    if send_event(&mut sender, delivery.event(), encoding).await.is_err() {
                        break;
                    }
                }

                msg = receiver.next() => {
                    let frame = match msg {
                        Some(Ok(Message::Text(text))) => WireFrame::Text(text),
                        Some(Ok(Message::Binary(data))) => WireFrame::Binary(data.into()),
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                        Some(Ok(Message::Close(_))) => {
                            debug!(session = %session, "Received close frame");
                            break;
                        }
                        Some(Err(e)) => {
                            warn!(session = %session, error = %e, "WebSocket error");
                            metrics::record_error("websocket");
                            break;
                        }
                        None => {
                            debug!(session = %session, "WebSocket stream ended");
                            break;
                        }
                    };

                    let start = Instant::now();
                    metrics::record_message(frame.len(), "inbound");
                    encoding = frame.encoding();

                    if let Some(reply) = dispatch(&state, &session, &frame).await {
                        if send_event(&mut sender, &reply, encoding).await.is_err() {
                            break;
                        }
                    }

                    metrics::record_latency(start.elapsed().as_secs_f64());
                }
            }
        }
    } else {
        error!(session = %session, "Failed to send connected event");
    }

    // Tell the rooms this session was in
    for (room, remaining) in state.registry.disconnect(&session) {
        state
            .registry
            .emit_to_room(&room, ServerEvent::UserLeft { active_users: remaining });
    }
    metrics::set_active_rooms(state.registry.stats().room_count);

    debug!(session = %session, "WebSocket disconnected");
}

/// Handle one incoming frame.
///
/// Returns the reply owed to the sender, if any. Room notifications travel
/// through the registry instead.
async fn dispatch(state: &AppState, session: &SessionId, frame: &WireFrame) -> Option<ServerEvent> {
    let limit = state.config.limits.max_message_size;
    if frame.len() > limit {
        warn!(session = %session, size = frame.len(), limit, "Message too large");
        metrics::record_error("too_large");
        return Some(ServerEvent::error(
            codes::MALFORMED,
            format!("Message of {} bytes exceeds the {} byte limit", frame.len(), limit),
        ));
    }

    let event: ClientEvent = match codec::decode(frame) {
        Ok(event) => event,
        Err(e) => {
            debug!(session = %session, error = %e, "Malformed event");
            metrics::record_error("malformed");
            return Some(ServerEvent::error(codes::MALFORMED, e.to_string()));
        }
    };

    match event {
        ClientEvent::Join { room } => {
            debug!(session = %session, room = %room, "Join request");

            match state.registry.join(session, &room) {
                Ok(outcome) => {
                    state.registry.emit_to_room(
                        &room,
                        ServerEvent::UserJoined {
                            active_users: outcome.members,
                        },
                    );
                    metrics::set_active_rooms(state.registry.stats().room_count);
                    None
                }
                Err(e) => {
                    warn!(session = %session, room = %room, error = %e, "Join failed");
                    Some(registry_error(&e))
                }
            }
        }

        ClientEvent::Leave { room } => {
            debug!(session = %session, room = %room, "Leave request");

            match state.registry.leave(session, &room) {
                Ok(remaining) => {
                    state.registry.emit_to_room(
                        &room,
                        ServerEvent::UserLeft {
                            active_users: remaining,
                        },
                    );
                    metrics::set_active_rooms(state.registry.stats().room_count);
                    None
                }
                Err(e) => Some(registry_error(&e)),
            }
        }

        ClientEvent::LiveUpdate {
            room,
            content,
            note_id,
        } => match state.sync.handle_update(session, &room, note_id, content).await {
            Ok(outcome) => {
                metrics::record_update(outcome.recipients);
                None
            }
            Err(SyncError::InvalidRoom(reason)) => {
                Some(ServerEvent::error(codes::INVALID_ROOM, reason))
            }
            Err(e @ SyncError::Persist { .. }) => {
                error!(session = %session, room = %room, error = %e, "Live update dropped");
                metrics::record_persist_failure();
                Some(ServerEvent::error(codes::PERSIST_FAILED, e.to_string()))
            }
        },

        ClientEvent::CursorPosition {
            room,
            position,
            user_id,
        } => {
            if !state.registry.session_rooms(session).contains(&room) {
                return Some(ServerEvent::error(
                    codes::NOT_IN_ROOM,
                    format!("Not in room: {}", room),
                ));
            }
            state
                .registry
                .broadcast_except(&room, session, ServerEvent::CursorMoved { user_id, position });
            None
        }

        ClientEvent::Ping { timestamp } => Some(ServerEvent::Pong { timestamp }),
    }
}

fn registry_error(err: &RegistryError) -> ServerEvent {
    let code = match err {
        RegistryError::NotInRoom(_) | RegistryError::UnknownSession(_) => codes::NOT_IN_ROOM,
        RegistryError::InvalidRoom(_) | RegistryError::MaxRoomsReached => codes::INVALID_ROOM,
    };
    ServerEvent::error(code, err.to_string())
}

/// Send an event to the WebSocket.
async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
    encoding: Encoding,
) -> Result<()> {
    let message = match codec::encode(event, encoding)? {
        WireFrame::Text(text) => Message::Text(text),
        WireFrame::Binary(data) => Message::Binary(data.to_vec()),
    };
    let len = match &message {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    };
    metrics::record_message(len, "outbound");
    sender.send(message).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use studynotes_core::MemoryStore;
    use studynotes_protocol::NoteId;

    fn state() -> AppState {
        AppState::new(Config::default(), Arc::new(MemoryStore::new()))
    }

    fn text(event: &ClientEvent) -> WireFrame {
        WireFrame::Text(codec::encode_text(event).unwrap())
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_error() {
        let state = state();
        let session = SessionId::new("a");
        let _rx = state.registry.connect(session.clone());

        let reply = dispatch(&state, &session, &WireFrame::Text("{not json".into())).await;
        assert!(matches!(
            reply,
            Some(ServerEvent::Error { code: codes::MALFORMED, .. })
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let mut config = Config::default();
        config.limits.max_message_size = 16;
        let state = AppState::new(config, Arc::new(MemoryStore::new()));
        let session = SessionId::new("a");
        let _rx = state.registry.connect(session.clone());

        let frame = text(&ClientEvent::live_update("note-1", "x".repeat(64), None));
        let reply = dispatch(&state, &session, &frame).await;
        assert!(matches!(
            reply,
            Some(ServerEvent::Error { code: codes::MALFORMED, .. })
        ));
        assert!(state.sync.document(&NoteId::new("1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_join_announces_to_room() {
        let state = state();
        let a = SessionId::new("a");
        let b = SessionId::new("b");
        let mut rx_a = state.registry.connect(a.clone());
        let _rx_b = state.registry.connect(b.clone());

        assert!(dispatch(&state, &a, &text(&ClientEvent::join("note-1"))).await.is_none());
        assert!(dispatch(&state, &b, &text(&ClientEvent::join("note-1"))).await.is_none());

        assert_eq!(
            rx_a.recv().await.unwrap().event(),
            &ServerEvent::UserJoined { active_users: 1 }
        );
        assert_eq!(
            rx_a.recv().await.unwrap().event(),
            &ServerEvent::UserJoined { active_users: 2 }
        );
    }

    #[tokio::test]
    async fn test_join_accepts_long_and_unusual_room_names() {
        let state = state();
        let a = SessionId::new("a");
        let mut rx = state.registry.connect(a.clone());
        let long_room = format!("note-{}", "7".repeat(300));

        for room in [long_room.as_str(), "note-\t1"] {
            assert!(dispatch(&state, &a, &text(&ClientEvent::join(room))).await.is_none());
            assert_eq!(
                rx.recv().await.unwrap().event(),
                &ServerEvent::UserJoined { active_users: 1 }
            );
        }

        let update = ClientEvent::live_update(long_room.as_str(), "kept", None);
        assert!(dispatch(&state, &a, &text(&update)).await.is_none());
        let doc = state.sync.document(&NoteId::new(&long_room[5..])).await.unwrap();
        assert_eq!(doc.map(|d| d.content).as_deref(), Some("kept"));
    }

    #[tokio::test]
    async fn test_many_rooms_per_session_by_default() {
        let state = state();
        let a = SessionId::new("a");
        let _rx = state.registry.connect(a.clone());

        for n in 0..65 {
            let join = ClientEvent::join(format!("note-{}", n));
            assert!(dispatch(&state, &a, &text(&join)).await.is_none());
        }
        assert_eq!(state.registry.session_rooms(&a).len(), 65);
    }

    #[tokio::test]
    async fn test_leave_unknown_room() {
        let state = state();
        let a = SessionId::new("a");
        let _rx = state.registry.connect(a.clone());

        let reply = dispatch(&state, &a, &text(&ClientEvent::leave("note-9"))).await;
        assert!(matches!(
            reply,
            Some(ServerEvent::Error { code: codes::NOT_IN_ROOM, .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_room_on_update() {
        let state = state();
        let a = SessionId::new("a");
        let _rx = state.registry.connect(a.clone());

        let reply = dispatch(&state, &a, &text(&ClientEvent::live_update("", "x", None))).await;
        assert!(matches!(
            reply,
            Some(ServerEvent::Error { code: codes::INVALID_ROOM, .. })
        ));
    }

    #[tokio::test]
    async fn test_cursor_requires_membership() {
        let state = state();
        let a = SessionId::new("a");
        let _rx = state.registry.connect(a.clone());

        let cursor = ClientEvent::CursorPosition {
            room: "note-1".into(),
            position: serde_json::json!({"index": 1}),
            user_id: None,
        };
        let reply = dispatch(&state, &a, &text(&cursor)).await;
        assert!(matches!(
            reply,
            Some(ServerEvent::Error { code: codes::NOT_IN_ROOM, .. })
        ));
    }

    #[tokio::test]
    async fn test_ping_binary_pong() {
        let state = state();
        let a = SessionId::new("a");
        let _rx = state.registry.connect(a.clone());

        let frame = WireFrame::Binary(codec::encode_binary(&ClientEvent::ping(Some(7))).unwrap());
        let reply = dispatch(&state, &a, &frame).await;
        assert_eq!(reply, Some(ServerEvent::Pong { timestamp: Some(7) }));
    }
}
