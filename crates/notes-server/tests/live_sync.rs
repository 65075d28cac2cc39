//! End-to-end live editing over WebSocket.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use studynotes_core::{DocumentStore, MemoryStore, SqliteStore};
use studynotes_protocol::{ClientEvent, Encoding, NoteId, ServerEvent, DEFAULT_ROOM};
use studynotes_server::{serve, AppState, Config};
use studynotes_transport::{
    Connection, LiveSession, WebSocketConfig, WebSocketConnection,
};
use tokio::net::TcpListener;

struct TestServer {
    url: String,
    state: Arc<AppState>,
}

async fn start(store: Arc<dyn DocumentStore>) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut config = Config::default();
    config.metrics.enabled = false;
    let state = Arc::new(AppState::new(config, store));
    tokio::spawn(serve(listener, Arc::clone(&state)));

    TestServer {
        url: format!("ws://{}/ws", addr),
        state,
    }
}

async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

async fn editor(server: &TestServer, note: Option<u64>) -> LiveSession {
    within(LiveSession::connect(
        &server.url,
        note.map(NoteId::from),
        String::new(),
    ))
    .await
    .unwrap()
}

async fn content(server: &TestServer, key: &str) -> Option<String> {
    server
        .state
        .sync
        .document(&NoteId::new(key))
        .await
        .unwrap()
        .map(|doc| doc.content)
}

/// Wait until the stored content of `key` equals `expected`.
async fn stored(store: &dyn DocumentStore, key: &str, expected: &str) {
    within(async {
        loop {
            let doc = store.get(&NoteId::new(key)).await.unwrap();
            if doc.as_ref().map(|d| d.content.as_str()) == Some(expected) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
}

#[tokio::test]
async fn two_editors_converge() {
    let server = start(Arc::new(MemoryStore::new())).await;
    let mut a = editor(&server, Some(1)).await;
    let mut b = editor(&server, Some(1)).await;

    a.edit("Hello").unwrap();
    a.save().unwrap();
    assert_eq!(within(b.next_remote_update()).await.as_deref(), Some("Hello"));

    b.edit("Hello World").unwrap();
    b.save().unwrap();
    assert_eq!(
        within(a.next_remote_update()).await.as_deref(),
        Some("Hello World")
    );

    assert_eq!(content(&server, "1").await.as_deref(), Some("Hello World"));
}

#[tokio::test]
async fn sender_never_receives_its_own_update() {
    let server = start(Arc::new(MemoryStore::new())).await;
    let mut a = editor(&server, Some(5)).await;
    let mut b = editor(&server, Some(5)).await;

    a.edit("from a").unwrap();
    a.save().unwrap();
    assert_eq!(within(b.next_remote_update()).await.as_deref(), Some("from a"));

    b.edit("from b").unwrap();
    b.save().unwrap();

    // An echo of "from a" would have been queued ahead of this
    assert_eq!(within(a.next_remote_update()).await.as_deref(), Some("from b"));
}

#[tokio::test]
async fn rooms_are_independent() {
    let server = start(Arc::new(MemoryStore::new())).await;
    let a = editor(&server, Some(42)).await;
    let b = editor(&server, Some(43)).await;
    let mut c = editor(&server, Some(42)).await;

    b.edit("forty-three").unwrap();
    b.save().unwrap();
    a.edit("forty-two").unwrap();
    a.save().unwrap();

    assert_eq!(
        within(c.next_remote_update()).await.as_deref(),
        Some("forty-two")
    );
    within(b.close()).await.unwrap();

    assert_eq!(content(&server, "42").await.as_deref(), Some("forty-two"));
    stored(server.state.sync.store().as_ref(), "43", "forty-three").await;
}

#[tokio::test]
async fn default_room_behaves_like_a_named_room() {
    let server = start(Arc::new(MemoryStore::new())).await;
    let a = editor(&server, None).await;
    let mut b = editor(&server, None).await;
    assert_eq!(a.room(), DEFAULT_ROOM);

    a.edit("untitled").unwrap();
    a.save().unwrap();
    assert_eq!(within(b.next_remote_update()).await.as_deref(), Some("untitled"));
    assert_eq!(content(&server, DEFAULT_ROOM).await.as_deref(), Some("untitled"));
}

#[tokio::test]
async fn closing_flushes_and_announces_departure() {
    let server = start(Arc::new(MemoryStore::new())).await;
    let a = editor(&server, Some(9)).await;
    let mut b = editor(&server, Some(9)).await;

    a.edit("last words").unwrap();
    let stats = within(a.close()).await.unwrap();
    assert_eq!(stats.emissions, 1);

    assert_eq!(
        within(b.next_remote_update()).await.as_deref(),
        Some("last words")
    );
    loop {
        match within(b.next_event()).await {
            Some(ServerEvent::UserLeft { active_users }) => {
                assert_eq!(active_users, 1);
                break;
            }
            Some(_) => continue,
            None => panic!("connection closed"),
        }
    }
}

#[tokio::test]
async fn edits_survive_in_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.db");

    let server = start(Arc::new(SqliteStore::open(&path).unwrap())).await;
    let a = editor(&server, Some(3)).await;
    a.edit("<p>persisted</p>").unwrap();
    within(a.close()).await.unwrap();

    let reopened = SqliteStore::open(&path).unwrap();
    stored(&reopened, "3", "<p>persisted</p>").await;
}

#[tokio::test]
async fn message_pack_session_gets_binary_replies() {
    let server = start(Arc::new(MemoryStore::new())).await;
    let config = WebSocketConfig {
        encoding: Encoding::MessagePack,
        ..WebSocketConfig::default()
    };
    let mut conn = within(WebSocketConnection::connect_with(&server.url, config))
        .await
        .unwrap();

    assert!(matches!(
        within(conn.recv()).await.unwrap(),
        Some(ServerEvent::Connected { version: 1, .. })
    ));

    conn.send(&ClientEvent::ping(Some(11))).await.unwrap();
    assert_eq!(
        within(conn.recv()).await.unwrap(),
        Some(ServerEvent::Pong { timestamp: Some(11) })
    );

    conn.send(&ClientEvent::leave("note-1")).await.unwrap();
    assert!(matches!(
        within(conn.recv()).await.unwrap(),
        Some(ServerEvent::Error { code: 1004, .. })
    ));
    conn.close().await.unwrap();
}
