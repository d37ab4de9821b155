//! Shared helpers for the integration suites: a mock document database
//! speaking the Arango document API's error contract, a minimal
//! frame-protocol client, and config scaffolding.
#![allow(dead_code)]

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::{Json, Path as UrlPath, State};
use axum::http::StatusCode;
use axum::routing::post;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use log_relay::config::RelayConfig;

// ---------------------------------------------------------------------------
// Mock document database
// ---------------------------------------------------------------------------

/// One recorded insert: (collection, document).
pub type InsertRecord = (String, Value);

/// In-memory stand-in for the central document database.
///
/// Mirrors the two error signals the relay depends on: duplicate `_key`
/// inserts get errorNum 1210, and keys planted via
/// [`MockBackend::reject_serialization_once`] get a single errorNum 600.
#[derive(Default)]
pub struct MockBackend {
    inserts: Mutex<Vec<InsertRecord>>,
    seen_keys: Mutex<HashSet<(String, String)>>,
    serialization_rejects: Mutex<HashSet<String>>,
    failing_keys: Mutex<HashSet<String>>,
}

impl MockBackend {
    /// Documents successfully inserted so far.
    pub fn inserts(&self) -> Vec<InsertRecord> {
        self.inserts.lock().unwrap().clone()
    }

    pub fn insert_count(&self) -> usize {
        self.inserts.lock().unwrap().len()
    }

    /// Documents inserted into one collection.
    pub fn inserts_into(&self, collection: &str) -> Vec<Value> {
        self.inserts
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == collection)
            .map(|(_, doc)| doc.clone())
            .collect()
    }

    /// Pretend `key` was already inserted into `collection`, so the next
    /// insert with that `_key` reports a duplicate.
    pub fn mark_seen(&self, collection: &str, key: &str) {
        self.seen_keys
            .lock()
            .unwrap()
            .insert((collection.to_owned(), key.to_owned()));
    }

    /// Make the next insert carrying `_key == key` fail with errorNum 600.
    pub fn reject_serialization_once(&self, key: &str) {
        self.serialization_rejects
            .lock()
            .unwrap()
            .insert(key.to_owned());
    }

    /// Make every insert carrying `_key == key` fail with a transient error.
    pub fn fail_key(&self, key: &str) {
        self.failing_keys.lock().unwrap().insert(key.to_owned());
    }
}

async fn handle_insert(
    State(backend): State<Arc<MockBackend>>,
    UrlPath((_db, collection)): UrlPath<(String, String)>,
    Json(document): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let key = document
        .get("_key")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();

    if backend.failing_keys.lock().unwrap().contains(&key) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "error": true,
                "code": 503,
                "errorNum": 1000,
                "errorMessage": "backend unavailable",
            })),
        );
    }

    if backend.serialization_rejects.lock().unwrap().remove(&key) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": true,
                "code": 400,
                "errorNum": 600,
                "errorMessage": "invalid JSON object",
            })),
        );
    }

    let fresh = backend
        .seen_keys
        .lock()
        .unwrap()
        .insert((collection.clone(), key));
    if !fresh {
        return (
            StatusCode::CONFLICT,
            Json(json!({
                "error": true,
                "code": 409,
                "errorNum": 1210,
                "errorMessage": "unique constraint violated - in index primary",
            })),
        );
    }

    backend.inserts.lock().unwrap().push((collection, document));
    (StatusCode::ACCEPTED, Json(json!({})))
}

/// Start the mock backend on an ephemeral port; returns its base URL and
/// the shared state for assertions.
pub async fn spawn_mock_backend() -> (String, Arc<MockBackend>) {
    let backend = Arc::new(MockBackend::default());
    let app = Router::new()
        .route("/_db/{db}/_api/document/{collection}", post(handle_insert))
        .with_state(backend.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock backend");
    let addr: SocketAddr = listener.local_addr().expect("mock backend addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    (format!("http://{}", addr), backend)
}

// ---------------------------------------------------------------------------
// Frame-protocol client
// ---------------------------------------------------------------------------

/// Write one v2 frame and return the ack byte.
pub async fn send_frame(stream: &mut UnixStream, body: &[u8]) -> u8 {
    write_frame(stream, body).await;
    read_ack(stream).await
}

/// Write the frame without waiting for the ack.
pub async fn write_frame(stream: &mut UnixStream, body: &[u8]) {
    let size = -(i32::try_from(body.len()).expect("body fits in i32"));
    stream
        .write_all(&size.to_le_bytes())
        .await
        .expect("write size");
    stream
        .write_all(&2i32.to_le_bytes())
        .await
        .expect("write version");
    stream.write_all(body).await.expect("write body");
}

pub async fn read_ack(stream: &mut UnixStream) -> u8 {
    let mut ack = [0u8; 1];
    stream.read_exact(&mut ack).await.expect("read ack");
    ack[0]
}

// ---------------------------------------------------------------------------
// Config scaffolding
// ---------------------------------------------------------------------------

/// A config pointing all paths into `dir` and the database at
/// `backend_url`. The socket heartbeat is off; tests that exercise it
/// flip `socket.check_exists` themselves.
pub fn test_config(dir: &Path, backend_url: &str, num_workers: usize) -> RelayConfig {
    let mut cfg = RelayConfig::default();
    cfg.socket.path = dir.join("relay.socket").to_string_lossy().into_owned();
    cfg.socket.check_exists = false;
    cfg.queue.sqlite_path = dir.join("queue.db").to_string_lossy().into_owned();
    cfg.sender.num_workers = num_workers;
    cfg.database.url = backend_url.to_owned();
    cfg
}

/// Poll `condition` every 20 ms until it holds or ~5 s elapse.
pub async fn wait_for(mut condition: impl FnMut() -> bool, what: &str) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}
