//! Parallel sender pool: drains queued events into the central database.
//!
//! The supervisor hands `SendRequest`s to a fixed set of worker tasks
//! over a shared work channel; every request produces exactly one
//! `SendResult` on the results channel, success or not. Workers share
//! nothing with each other (each owns its own database client) and
//! exit when the shutdown latch flips.
//!
//! # Per-request pipeline
//! decode JSON → attach `_key` → pick collection by discriminator field →
//! insert. Duplicate-key responses count as delivered; a backend
//! serialization rejection stringifies `args` and retries once;
//! undecodable payloads are warned about and reported as success so the
//! supervisor deletes them (the single lossy path).

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::arango::{ArangoClient, ArangoError};
use crate::config::{CollectionsConfig, DatabaseConfig};

/// How long a worker blocks on the work channel before re-checking the
/// shutdown latch.
const WORK_POLL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Channel item types
// ---------------------------------------------------------------------------

/// One queued entry handed to a worker.
#[derive(Debug)]
pub struct SendRequest {
    pub entry_id: String,
    pub payload: Vec<u8>,
}

/// Worker's verdict on one request. `error: None` means the entry may be
/// deleted from the queue.
#[derive(Debug)]
pub struct SendResult {
    pub entry_id: String,
    pub error: Option<ArangoError>,
}

// ---------------------------------------------------------------------------
// Event classification
// ---------------------------------------------------------------------------

/// The five event kinds of the wire format, distinguished by which
/// top-level field is present. The order of checks is part of the
/// protocol: `message` wins over `scope_path`, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Message,
    ScopeStart,
    ScopeEnd,
    QaTrace,
    Thread,
}

/// Map a decoded document to its kind, or `None` when no discriminator
/// field is present.
pub fn classify(document: &Map<String, Value>) -> Option<EventKind> {
    if document.contains_key("message") {
        Some(EventKind::Message)
    } else if document.contains_key("scope_path") {
        Some(EventKind::ScopeStart)
    } else if document.contains_key("end_time") {
        Some(EventKind::ScopeEnd)
    } else if document.contains_key("qa_trace_version") {
        Some(EventKind::QaTrace)
    } else if document.contains_key("thread_id") {
        Some(EventKind::Thread)
    } else {
        None
    }
}

/// Resolve the configured collection name for a kind.
pub fn collection_for(collections: &CollectionsConfig, kind: EventKind) -> &str {
    match kind {
        EventKind::Message => &collections.messages,
        EventKind::ScopeStart => &collections.scope_starts,
        EventKind::ScopeEnd => &collections.scope_ends,
        EventKind::QaTrace => &collections.qa_traces,
        EventKind::Thread => &collections.threads,
    }
}

// ---------------------------------------------------------------------------
// Payload decoding
// ---------------------------------------------------------------------------

struct DecodedDocument {
    document: Map<String, Value>,
    /// The payload carried bare non-finite number tokens that were quoted
    /// to make it parse.
    non_finite: bool,
}

/// Decode a payload into a JSON object, or `None` when it cannot be used.
///
/// Python producers emit bare `NaN`/`Infinity` tokens that strict JSON
/// rejects; those are quoted in place and the document is flagged so the
/// caller stringifies `args` before inserting.
fn decode_document(entry_id: &str, payload: &[u8]) -> Option<DecodedDocument> {
    match serde_json::from_slice::<Value>(payload) {
        Ok(Value::Object(document)) => {
            return Some(DecodedDocument {
                document,
                non_finite: false,
            });
        }
        Ok(_) => {}
        Err(_) => {
            if let Some(rewritten) = quote_non_finite(payload) {
                if let Ok(Value::Object(document)) = serde_json::from_slice::<Value>(&rewritten) {
                    return Some(DecodedDocument {
                        document,
                        non_finite: true,
                    });
                }
            }
        }
    }

    warn!(
        entry_id,
        payload = %String::from_utf8_lossy(&payload[..payload.len().min(256)]),
        "failed to decode message, skipping it"
    );
    None
}

/// Quote bare `NaN`, `Infinity` and `-Infinity` tokens outside string
/// literals. Returns `None` when nothing was rewritten.
fn quote_non_finite(payload: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(payload.len() + 8);
    let mut rewrote = false;
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;

    while i < payload.len() {
        let byte = payload[i];
        if in_string {
            out.push(byte);
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        if byte == b'"' {
            in_string = true;
            out.push(byte);
            i += 1;
            continue;
        }

        let rest = &payload[i..];
        let token_len = if rest.starts_with(b"NaN") {
            Some(3)
        } else if rest.starts_with(b"Infinity") {
            Some(8)
        } else if rest.starts_with(b"-Infinity") {
            Some(9)
        } else {
            None
        };
        if let Some(len) = token_len {
            let boundary = rest
                .get(len)
                .is_none_or(|c| !c.is_ascii_alphanumeric() && *c != b'_');
            if boundary {
                out.push(b'"');
                out.extend_from_slice(&rest[..len]);
                out.push(b'"');
                rewrote = true;
                i += len;
                continue;
            }
        }

        out.push(byte);
        i += 1;
    }

    if rewrote { Some(out) } else { None }
}

/// Replace `args` with its JSON text form.
///
/// Workaround for argument lists the backend cannot encode. Only applied
/// to log entries that actually carry arguments.
fn stringify_args(document: &mut Map<String, Value>) {
    if document.contains_key("message") {
        if let Some(args) = document.get("args") {
            let text = args.to_string();
            document.insert("args".to_owned(), Value::String(text));
        }
    }
}

// ---------------------------------------------------------------------------
// SenderWorker
// ---------------------------------------------------------------------------

type SharedWorkRx = Arc<Mutex<mpsc::Receiver<SendRequest>>>;

struct SenderWorker {
    worker_id: usize,
    db: ArangoClient,
    collections: CollectionsConfig,
}

impl SenderWorker {
    async fn run(
        self,
        work: SharedWorkRx,
        results: mpsc::Sender<SendResult>,
        shutdown: watch::Receiver<bool>,
    ) {
        info!(worker_id = self.worker_id, "sender worker started");

        while !*shutdown.borrow() {
            let request = {
                let mut rx = work.lock().await;
                if *shutdown.borrow() {
                    break;
                }
                match timeout(WORK_POLL, rx.recv()).await {
                    Err(_) => continue,
                    Ok(None) => return,
                    Ok(Some(request)) => request,
                }
            };

            let result = self.handle_request(request).await;
            if results.send(result).await.is_err() {
                return;
            }
        }

        info!(worker_id = self.worker_id, "sender worker finished cleanly");
    }

    async fn handle_request(&self, request: SendRequest) -> SendResult {
        match self.send_entry(&request.entry_id, &request.payload).await {
            Ok(()) => SendResult {
                entry_id: request.entry_id,
                error: None,
            },
            Err(e) => {
                warn!(
                    worker_id = self.worker_id,
                    entry_id = %request.entry_id,
                    error = %e,
                    "send worker failed to process request"
                );
                SendResult {
                    entry_id: request.entry_id,
                    error: Some(e),
                }
            }
        }
    }

    async fn send_entry(&self, entry_id: &str, payload: &[u8]) -> Result<(), ArangoError> {
        let Some(decoded) = decode_document(entry_id, payload) else {
            // Undecodable: report success so the supervisor deletes it.
            return Ok(());
        };
        let DecodedDocument {
            mut document,
            non_finite,
        } = decoded;

        document.insert("_key".to_owned(), Value::String(entry_id.to_owned()));
        if non_finite {
            warn!(entry_id, "non-finite numbers in payload, stringifying args");
            stringify_args(&mut document);
        }

        let Some(kind) = classify(&document) else {
            warn!(entry_id, "document matches no known event kind, skipping it");
            return Ok(());
        };
        let collection = collection_for(&self.collections, kind);

        match self.insert_ignoring_duplicates(collection, &document).await {
            Err(e) if e.is_serialization_rejected() => {
                warn!(
                    entry_id,
                    "backend rejected document (non-finite numbers?), retrying with stringified args"
                );
                stringify_args(&mut document);
                self.insert_ignoring_duplicates(collection, &document).await
            }
            other => other,
        }
    }

    async fn insert_ignoring_duplicates(
        &self,
        collection: &str,
        document: &Map<String, Value>,
    ) -> Result<(), ArangoError> {
        match self
            .db
            .insert(collection, &Value::Object(document.clone()))
            .await
        {
            Err(e) if e.is_duplicate_key() => {
                let key = document.get("_key").and_then(Value::as_str).unwrap_or("?");
                warn!(entry_id = key, "entry already inserted, ignoring");
                Ok(())
            }
            other => other,
        }
    }
}

// ---------------------------------------------------------------------------
// SenderPool
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("sender worker {0} died before the end of task")]
    WorkerDied(usize),
    #[error("work channel closed")]
    WorkChannelClosed,
    #[error("results channel closed")]
    ResultsChannelClosed,
}

/// A fixed-size pool of sender workers plus the channels to reach them.
///
/// The channels are bounded by the worker count: the supervisor's batch
/// accounting keeps at most one request in flight per worker.
pub struct SenderPool {
    workers: Vec<JoinHandle<()>>,
    work_tx: mpsc::Sender<SendRequest>,
    results_rx: mpsc::Receiver<SendResult>,
    shutdown_tx: watch::Sender<bool>,
}

impl SenderPool {
    /// Spawn `num_workers` workers, each with its own database client.
    pub fn spawn(num_workers: usize, database: &DatabaseConfig) -> Result<Self, ArangoError> {
        let (work_tx, work_rx) = mpsc::channel(num_workers);
        let work_rx: SharedWorkRx = Arc::new(Mutex::new(work_rx));
        let (results_tx, results_rx) = mpsc::channel(num_workers);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut workers = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let worker = SenderWorker {
                worker_id,
                db: ArangoClient::new(database)?,
                collections: database.collections.clone(),
            };
            workers.push(tokio::spawn(worker.run(
                work_rx.clone(),
                results_tx.clone(),
                shutdown_rx.clone(),
            )));
        }

        Ok(SenderPool {
            workers,
            work_tx,
            results_rx,
            shutdown_tx,
        })
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Hand one request to the pool.
    pub async fn submit(&self, request: SendRequest) -> Result<(), PoolError> {
        self.work_tx
            .send(request)
            .await
            .map_err(|_| PoolError::WorkChannelClosed)
    }

    /// Index of the first worker that is no longer running, if any.
    ///
    /// A worker that stops before the latch is set counts as dead,
    /// panic or clean return alike; the supervisor turns that into a
    /// loud restart.
    pub fn dead_worker(&self) -> Option<usize> {
        self.workers.iter().position(JoinHandle::is_finished)
    }

    /// Wait up to `wait` for the next result. `Ok(None)` on timeout.
    pub async fn next_result(&mut self, wait: Duration) -> Result<Option<SendResult>, PoolError> {
        match timeout(wait, self.results_rx.recv()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(PoolError::ResultsChannelClosed),
            Ok(Some(result)) => Ok(Some(result)),
        }
    }

    /// Set the shutdown latch and join every worker.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.workers.drain(..) {
            let _ = handle.await;
        }
    }

    /// Abort a worker task outright. Test hook simulating a worker crash.
    #[doc(hidden)]
    pub fn abort_worker(&self, index: usize) {
        if let Some(handle) = self.workers.get(index) {
            handle.abort();
        }
    }
}
