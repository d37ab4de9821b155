//! Supervisor: wires the queue, id generator, frame ingest and sender
//! pool together and drives the send loop.
//!
//! Reliability model: every accepted frame is on disk before it is
//! acknowledged, and a queue entry is only deleted after the backend
//! confirmed the insert (or reported a duplicate). Anything unexpected
//! (a send error, a dead worker, a vanished socket file) makes the
//! supervisor set the shutdown latch, join the workers and surface the
//! error; external supervision restarts the process and the boot scan
//! re-seeds delivery from disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::arango::ArangoError;
use crate::config::RelayConfig;
use crate::event_id::IdGenerator;
use crate::sender::{PoolError, SendRequest, SendResult, SenderPool};
use crate::storage::queue::{EventQueue, QueueError};

/// Per-id pull timeout when assembling a batch.
const PENDING_POLL: Duration = Duration::from_millis(100);

/// Poll interval on the results channel between worker-liveness checks.
const RESULT_POLL: Duration = Duration::from_secs(1);

/// Upper bound on batches per drain cycle, so the throughput report and
/// the socket heartbeat still run under sustained load.
const MAX_BATCHES_PER_CYCLE: usize = 100;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ForwarderError {
    #[error("queue: {0}")]
    Queue(#[from] QueueError),
    #[error("{0}")]
    Pool(#[from] PoolError),
    #[error("send failed for entry {entry_id}: {source}")]
    Send {
        entry_id: String,
        #[source]
        source: ArangoError,
    },
    #[error("database client: {0}")]
    Database(#[from] ArangoError),
    #[error("socket file {0} is missing")]
    SocketFileMissing(PathBuf),
    #[error("pending-ids channel closed")]
    PendingChannelClosed,
}

// ---------------------------------------------------------------------------
// IngestHandle
// ---------------------------------------------------------------------------

/// The frame server's view of the supervisor: persist a payload, hand
/// its id to the send loop. Cheap to clone, one per connection handler.
#[derive(Clone)]
pub struct IngestHandle {
    queue: Arc<Mutex<EventQueue>>,
    ids: Arc<IdGenerator>,
    pending_tx: mpsc::UnboundedSender<String>,
}

impl IngestHandle {
    /// Assign an id, write the payload to disk, enqueue the id for
    /// dispatch. The caller must not ack its peer until this returns.
    pub async fn entry_received(&self, payload: Vec<u8>) -> Result<String, ForwarderError> {
        let entry_id = self.ids.next_id();
        self.queue.lock().await.put(&entry_id, &payload)?;
        self.pending_tx
            .send(entry_id.clone())
            .map_err(|_| ForwarderError::PendingChannelClosed)?;
        Ok(entry_id)
    }
}

// ---------------------------------------------------------------------------
// Forwarder
// ---------------------------------------------------------------------------

/// Owns the durable queue, the pending-ids buffer and the sender pool.
pub struct Forwarder {
    queue: Arc<Mutex<EventQueue>>,
    ids: Arc<IdGenerator>,
    pending_tx: mpsc::UnboundedSender<String>,
    pending_rx: mpsc::UnboundedReceiver<String>,
    pool: SenderPool,
    socket_path: PathBuf,
    check_socket: bool,
}

impl Forwarder {
    /// Open the queue and spawn the sender pool.
    pub fn new(config: &RelayConfig) -> Result<Self, ForwarderError> {
        let queue = EventQueue::open(Path::new(&config.queue.sqlite_path))?;
        let pool = SenderPool::spawn(config.sender.num_workers, &config.database)?;
        let (pending_tx, pending_rx) = mpsc::unbounded_channel();

        Ok(Forwarder {
            queue: Arc::new(Mutex::new(queue)),
            ids: Arc::new(IdGenerator::new()),
            pending_tx,
            pending_rx,
            pool,
            socket_path: PathBuf::from(&config.socket.path),
            check_socket: config.socket.check_exists,
        })
    }

    /// Handle for the frame server's connection handlers.
    pub fn ingest_handle(&self) -> IngestHandle {
        IngestHandle {
            queue: self.queue.clone(),
            ids: self.ids.clone(),
            pending_tx: self.pending_tx.clone(),
        }
    }

    /// Enqueue every entry already on disk: entries accepted by a
    /// previous process lifetime that were never delivered.
    pub async fn seed_pending_from_queue(&self) -> Result<usize, ForwarderError> {
        let ids = self.queue.lock().await.scan_ids()?;
        let count = ids.len();
        for entry_id in ids {
            self.pending_tx
                .send(entry_id)
                .map_err(|_| ForwarderError::PendingChannelClosed)?;
        }
        if count > 0 {
            info!(count, "re-enqueued persisted entries from previous run");
        }
        Ok(count)
    }

    /// Drive the send loop until something goes wrong. Never returns
    /// `Ok`; the latch is set and every worker joined before the error
    /// is handed back.
    pub async fn run(mut self) -> Result<(), ForwarderError> {
        let result = self.send_forever().await;
        self.pool.shutdown().await;
        result
    }

    async fn send_forever(&mut self) -> Result<(), ForwarderError> {
        loop {
            let cycle_start = Instant::now();
            let num_sent = self.drain_pending().await?;

            if num_sent > 0 {
                let elapsed = cycle_start.elapsed().as_secs_f64();
                info!(
                    num_sent,
                    elapsed_s = elapsed,
                    rate = num_sent as f64 / elapsed,
                    pending = self.pending_rx.len(),
                    "sent messages"
                );
            }

            if self.check_socket && !self.socket_path.exists() {
                warn!(path = %self.socket_path.display(), "socket file is missing");
                return Err(ForwarderError::SocketFileMissing(self.socket_path.clone()));
            }
        }
    }

    /// Send batches until the pending buffer runs dry or the cycle cap
    /// is reached. Returns the number of entries delivered.
    async fn drain_pending(&mut self) -> Result<usize, ForwarderError> {
        let mut total = 0;
        for _ in 0..MAX_BATCHES_PER_CYCLE {
            let sent = self.send_batch().await?;
            if sent == 0 {
                break;
            }
            total += sent;
        }
        Ok(total)
    }

    /// Submit one batch (at most one request per worker) and account for
    /// exactly as many results. Successes are deleted from the queue;
    /// failures are re-enqueued and the first one aborts the process.
    async fn send_batch(&mut self) -> Result<usize, ForwarderError> {
        let mut submitted = 0;
        for entry_id in self.next_batch().await {
            let payload = self.queue.lock().await.get(&entry_id)?;
            let Some(payload) = payload else {
                // Already delivered and deleted in an earlier cycle.
                warn!(entry_id = %entry_id, "pending id has no stored payload, skipping");
                continue;
            };
            self.pool.submit(SendRequest { entry_id, payload }).await?;
            submitted += 1;
        }

        let mut first_error = None;
        for _ in 0..submitted {
            let result = self.next_result().await?;
            match result.error {
                None => {
                    self.queue.lock().await.delete(&result.entry_id)?;
                }
                Some(e) => {
                    // The entry stays on disk and in pending; it is
                    // retried after the restart this error forces.
                    let _ = self.pending_tx.send(result.entry_id.clone());
                    error!(entry_id = %result.entry_id, error = %e, "error while sending");
                    if first_error.is_none() {
                        first_error = Some(ForwarderError::Send {
                            entry_id: result.entry_id,
                            source: e,
                        });
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(submitted),
        }
    }

    /// Pull up to one id per worker off the pending buffer, giving each
    /// slot a short grace period.
    async fn next_batch(&mut self) -> Vec<String> {
        let batch_size = self.pool.num_workers();
        let mut ids = Vec::with_capacity(batch_size);
        for _ in 0..batch_size {
            match timeout(PENDING_POLL, self.pending_rx.recv()).await {
                Ok(Some(entry_id)) => ids.push(entry_id),
                Ok(None) | Err(_) => break,
            }
        }
        ids
    }

    /// Wait for the next send result, checking worker liveness between
    /// polls so a silent worker death becomes a loud restart.
    async fn next_result(&mut self) -> Result<SendResult, ForwarderError> {
        loop {
            if let Some(worker_id) = self.pool.dead_worker() {
                return Err(ForwarderError::Pool(PoolError::WorkerDied(worker_id)));
            }
            match self.pool.next_result(RESULT_POLL).await? {
                Some(result) => return Ok(result),
                None => info!("no send results available yet, waiting"),
            }
        }
    }

    /// Crash one sender worker. Test hook for the liveness path.
    #[doc(hidden)]
    pub fn abort_sender_worker(&self, index: usize) {
        self.pool.abort_worker(index);
    }
}
