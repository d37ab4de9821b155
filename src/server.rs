//! Unix-domain frame server: the local ingest side of the relay.
//!
//! # Wire protocol (one frame)
//! - message size: 4 bytes, little endian, **negative**; the absolute
//!   value is the body length. A positive size marks the retired legacy
//!   protocol and is rejected.
//! - protocol version: 4 bytes, little endian, equals 2.
//! - message body: |size| bytes.
//!
//! Each frame is acknowledged with a single `0x55` byte, written only
//! after the payload is durably stored. Frames on one connection are
//! strictly sequential; concurrency comes from serving many connections.
//!
//! The socket is world-writable after bind: producers are trusted local
//! processes, there is no authentication on this path.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::forwarder::IngestHandle;

/// Reply byte confirming a durably stored frame.
pub const ACK_BYTE: u8 = 0x55;

/// The only supported protocol version.
pub const PROTOCOL_VERSION: i32 = 2;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can arise while setting the server up.
#[derive(Debug)]
pub enum ServerError {
    /// Could not remove a stale socket file at the configured path.
    StaleSocket(io::Error),
    /// Failed to bind the unix-domain listener.
    Bind(io::Error),
    /// Failed to open up the socket file permissions.
    Permissions(io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::StaleSocket(e) => write!(f, "removing stale socket: {}", e),
            ServerError::Bind(e) => write!(f, "bind failed: {}", e),
            ServerError::Permissions(e) => write!(f, "chmod failed: {}", e),
        }
    }
}

impl std::error::Error for ServerError {}

/// Per-frame protocol violations. Any of these closes the connection.
#[derive(Debug)]
enum FrameError {
    ZeroSize,
    LegacySize(i32),
    UnsupportedVersion(i32),
    Io(io::Error),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::ZeroSize => write!(f, "zero-length frame"),
            FrameError::LegacySize(size) => {
                write!(f, "positive frame size {} (legacy protocol, unsupported)", size)
            }
            FrameError::UnsupportedVersion(v) => write!(f, "unsupported protocol version {}", v),
            FrameError::Io(e) => write!(f, "read failed: {}", e),
        }
    }
}

// ---------------------------------------------------------------------------
// FrameServer
// ---------------------------------------------------------------------------

/// Listener on the relay's unix-domain socket.
pub struct FrameServer {
    listener: UnixListener,
    path: PathBuf,
}

impl FrameServer {
    /// Bind the socket at `path`, replacing any stale file left by a
    /// previous process, and open its mode to `0777`.
    pub fn bind(path: &Path) -> Result<Self, ServerError> {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(ServerError::StaleSocket(e)),
        }

        let listener = UnixListener::bind(path).map_err(ServerError::Bind)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))
            .map_err(ServerError::Permissions)?;

        info!(path = %path.display(), "accepting connections");
        Ok(FrameServer {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn local_path(&self) -> &Path {
        &self.path
    }

    /// Run the accept loop. Each connection gets its own task; handlers
    /// share nothing but the ingest handle.
    pub async fn run(self, ingest: IngestHandle) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _peer_addr)) => {
                    tokio::spawn(serve_connection(stream, ingest.clone()));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed, stopping frame server");
                    break;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-connection handler
// ---------------------------------------------------------------------------

/// Serve one producer connection: read frames sequentially, persist each,
/// ack each. Runs until the peer closes or a protocol violation occurs.
async fn serve_connection(mut stream: UnixStream, ingest: IngestHandle) {
    loop {
        let body = match read_frame(&mut stream).await {
            Ok(Some(body)) => body,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "protocol error, closing connection");
                break;
            }
        };

        match ingest.entry_received(body).await {
            Ok(entry_id) => {
                debug!(entry_id = %entry_id, "frame accepted");
            }
            Err(e) => {
                // No ack: the producer will retry over a fresh connection.
                warn!(error = %e, "failed to persist frame, closing connection");
                break;
            }
        }

        if stream.write_all(&[ACK_BYTE]).await.is_err() {
            break;
        }
    }
}

/// Read one frame body. `Ok(None)` means the peer closed the connection;
/// a close mid-frame discards the partial frame without storing anything.
async fn read_frame(stream: &mut UnixStream) -> Result<Option<Vec<u8>>, FrameError> {
    let size = match read_i32(stream).await? {
        Some(size) => size,
        None => return Ok(None),
    };
    if size == 0 {
        return Err(FrameError::ZeroSize);
    }
    if size > 0 {
        return Err(FrameError::LegacySize(size));
    }

    let version = match read_i32(stream).await? {
        Some(version) => version,
        None => return Ok(None),
    };
    if version != PROTOCOL_VERSION {
        return Err(FrameError::UnsupportedVersion(version));
    }

    let mut body = vec![0u8; size.unsigned_abs() as usize];
    match stream.read_exact(&mut body).await {
        Ok(_) => Ok(Some(body)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(FrameError::Io(e)),
    }
}

/// Read a little-endian i32, or `None` if the peer closed first.
async fn read_i32(stream: &mut UnixStream) -> Result<Option<i32>, FrameError> {
    match stream.read_i32_le().await {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(FrameError::Io(e)),
    }
}
