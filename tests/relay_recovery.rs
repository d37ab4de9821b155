/// End-to-end relay tests: socket → queue → sender pool → mock backend.
///
/// Validates:
/// - a framed log entry is acked, delivered to `messages` under its
///   queue id, and removed from the queue
/// - entries persisted by a previous process lifetime are re-enqueued
///   at boot and drained (crash-between-put-and-send recovery)
/// - a duplicate-key response deletes the entry without surfacing an
///   error or stopping the relay
/// - a dead sender worker terminates the supervisor with an error
/// - a transient backend failure re-enqueues the entry and terminates
/// - removal of the socket file terminates the supervisor
mod common;

use std::path::Path;
use std::time::Duration;

use log_relay::event_id::IdGenerator;
use log_relay::forwarder::{Forwarder, ForwarderError};
use log_relay::sender::PoolError;
use log_relay::server::FrameServer;
use log_relay::storage::queue::EventQueue;
use serde_json::Value;
use tokio::net::UnixStream;

use common::{send_frame, spawn_mock_backend, test_config, wait_for};

const LOG_ENTRY: &[u8] =
    br#"{"message":"hi","thread_id":"t1","timestamp":1.0,"level":"INFO","file":"x.py","line":1,"args":[]}"#;

fn queue_len(dir: &Path) -> i64 {
    EventQueue::open(&dir.join("queue.db"))
        .expect("open queue")
        .len()
        .expect("queue len")
}

// ---------------------------------------------------------------------------
// Round trip
// ---------------------------------------------------------------------------

#[tokio::test]
async fn accepted_frame_is_delivered_and_dequeued() {
    let (url, backend) = spawn_mock_backend().await;
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path(), &url, 2);

    let forwarder = Forwarder::new(&cfg).expect("forwarder");
    assert_eq!(forwarder.seed_pending_from_queue().await.unwrap(), 0);

    let server = FrameServer::bind(Path::new(&cfg.socket.path)).expect("bind");
    tokio::spawn(server.run(forwarder.ingest_handle()));
    let run_task = tokio::spawn(forwarder.run());

    let mut stream = UnixStream::connect(&cfg.socket.path).await.expect("connect");
    let ack = send_frame(&mut stream, LOG_ENTRY).await;
    assert_eq!(ack, 0x55);

    wait_for(|| backend.inserts_into("messages").len() == 1, "delivery").await;

    let doc = &backend.inserts_into("messages")[0];
    assert_eq!(doc.get("message").and_then(Value::as_str), Some("hi"));
    let key = doc.get("_key").and_then(Value::as_str).expect("_key");
    assert_eq!(key.len(), 28, "_key must be a full relay id: {}", key);

    let dir_path = dir.path().to_path_buf();
    wait_for(|| queue_len(&dir_path) == 0, "queue drain").await;

    run_task.abort();
}

// ---------------------------------------------------------------------------
// Restart recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn entries_from_previous_lifetime_are_recovered() {
    let (url, backend) = spawn_mock_backend().await;
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path(), &url, 4);

    // Previous lifetime: 100 accepted entries, none delivered.
    {
        let mut queue = EventQueue::open(Path::new(&cfg.queue.sqlite_path)).unwrap();
        let ids = IdGenerator::new();
        for i in 0..100 {
            let body = format!(r#"{{"message":"recovered-{}","thread_id":"t"}}"#, i);
            queue.put(&ids.next_id(), body.as_bytes()).unwrap();
        }
    }

    // Restart: boot scan must re-seed all of them.
    let forwarder = Forwarder::new(&cfg).expect("forwarder");
    assert_eq!(forwarder.seed_pending_from_queue().await.unwrap(), 100);
    let run_task = tokio::spawn(forwarder.run());

    wait_for(|| backend.inserts_into("messages").len() == 100, "recovery").await;
    let dir_path = dir.path().to_path_buf();
    wait_for(|| queue_len(&dir_path) == 0, "queue drain").await;

    run_task.abort();
}

// ---------------------------------------------------------------------------
// Duplicate tolerance
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_key_deletes_entry_without_error() {
    let (url, backend) = spawn_mock_backend().await;
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path(), &url, 2);

    let entry_id = {
        let mut queue = EventQueue::open(Path::new(&cfg.queue.sqlite_path)).unwrap();
        let id = IdGenerator::new().next_id();
        queue.put(&id, LOG_ENTRY).unwrap();
        id
    };
    // The backend already has this document from an earlier send.
    backend.mark_seen("messages", &entry_id);

    let forwarder = Forwarder::new(&cfg).expect("forwarder");
    forwarder.seed_pending_from_queue().await.unwrap();
    let run_task = tokio::spawn(forwarder.run());

    let dir_path = dir.path().to_path_buf();
    wait_for(|| queue_len(&dir_path) == 0, "duplicate entry deletion").await;
    assert_eq!(backend.insert_count(), 0, "no second document");
    assert!(!run_task.is_finished(), "relay must keep serving");

    run_task.abort();
}

// ---------------------------------------------------------------------------
// Failure paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dead_worker_terminates_the_supervisor() {
    let (url, _backend) = spawn_mock_backend().await;
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path(), &url, 2);

    {
        let mut queue = EventQueue::open(Path::new(&cfg.queue.sqlite_path)).unwrap();
        queue.put(&IdGenerator::new().next_id(), LOG_ENTRY).unwrap();
    }

    let forwarder = Forwarder::new(&cfg).expect("forwarder");
    forwarder.seed_pending_from_queue().await.unwrap();
    forwarder.abort_sender_worker(0);

    let result = tokio::time::timeout(Duration::from_secs(10), forwarder.run())
        .await
        .expect("run must return after a worker death");
    assert!(
        matches!(result, Err(ForwarderError::Pool(PoolError::WorkerDied(_)))),
        "got {:?}",
        result
    );
}

#[tokio::test]
async fn transient_backend_failure_reenqueues_and_terminates() {
    let (url, backend) = spawn_mock_backend().await;
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path(), &url, 2);

    let entry_id = {
        let mut queue = EventQueue::open(Path::new(&cfg.queue.sqlite_path)).unwrap();
        let id = IdGenerator::new().next_id();
        queue.put(&id, LOG_ENTRY).unwrap();
        id
    };
    backend.fail_key(&entry_id);

    let forwarder = Forwarder::new(&cfg).expect("forwarder");
    forwarder.seed_pending_from_queue().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(10), forwarder.run())
        .await
        .expect("run must surface the send error");
    match result {
        Err(ForwarderError::Send { entry_id: failed, .. }) => assert_eq!(failed, entry_id),
        other => panic!("expected a send error, got {:?}", other),
    }

    // At-least-once: the entry is still on disk for the next lifetime.
    assert_eq!(queue_len(dir.path()), 1);
}

#[tokio::test]
async fn socket_file_removal_terminates_the_supervisor() {
    let (url, _backend) = spawn_mock_backend().await;
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path(), &url, 2);
    cfg.socket.check_exists = true;

    let forwarder = Forwarder::new(&cfg).expect("forwarder");
    let server = FrameServer::bind(Path::new(&cfg.socket.path)).expect("bind");
    tokio::spawn(server.run(forwarder.ingest_handle()));
    let run_task = tokio::spawn(forwarder.run());

    std::fs::remove_file(&cfg.socket.path).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(10), run_task)
        .await
        .expect("run must notice the missing socket")
        .expect("join");
    assert!(
        matches!(result, Err(ForwarderError::SocketFileMissing(_))),
        "got {:?}",
        result
    );
}
