//! Sortable per-process unique ids for queue entries.
//!
//! # Id layout
//! `HHHH-TTTTTTRRRRR-SSSSSSSSSSS`, all base62, `-`-separated:
//! - `H` (4 chars): digest of the hostname, stable across restarts.
//! - `T` (6 chars) + `R` (5 chars): the process tag, computed once at
//!   startup. The epoch-seconds prefix makes ids from a restarted
//!   process sort after every id of the previous lifetime; the random
//!   suffix keeps concurrent processes apart.
//! - `S` (11 chars): sequence number, strictly increasing under a mutex.
//!
//! Padding widths are part of the persisted contract: ids are compared
//! as bytes, so every field must be fixed-width and the alphabet must be
//! in ASCII order.

use sha2::{Digest, Sha256};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Base62 alphabet in ASCII order, so lexicographic comparison of encoded
/// strings agrees with numeric comparison of the underlying values.
const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

const HOST_TAG_WIDTH: usize = 4;
const TIMESTAMP_WIDTH: usize = 6;
const RANDOM_WIDTH: usize = 5;
const SEQ_WIDTH: usize = 11;

// ---------------------------------------------------------------------------
// IdGenerator
// ---------------------------------------------------------------------------

/// Hands out queue entry ids: `<host>-<process>-<seq>`.
///
/// The host and process tags are fixed for the generator's lifetime; only
/// the sequence counter advances.
pub struct IdGenerator {
    prefix: String,
    seq: Mutex<u64>,
}

impl IdGenerator {
    /// Build a generator with the real host tag and a fresh process tag.
    pub fn new() -> Self {
        Self::with_prefix(format!("{}-{}", host_tag(), process_tag()))
    }

    /// Build a generator over an explicit `host-process` prefix.
    ///
    /// Lets tests pin the restart-ordering behavior without clock control.
    pub fn with_prefix(prefix: String) -> Self {
        IdGenerator {
            prefix,
            seq: Mutex::new(0),
        }
    }

    /// Allocate the next id. Sequence numbers start at 1.
    pub fn next_id(&self) -> String {
        let seq = {
            let mut guard = self.seq.lock().unwrap_or_else(|poisoned| {
                // A panic while holding the lock cannot leave the counter
                // mid-update (the increment is a single store).
                poisoned.into_inner()
            });
            *guard += 1;
            *guard
        };
        format!("{}-{}", self.prefix, base62(u128::from(seq), SEQ_WIDTH))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tag construction
// ---------------------------------------------------------------------------

/// Encode `value` in base62, left-padded with `0` to exactly `width` chars.
///
/// `value` is folded modulo `62^width` so the result is always fixed-width.
fn base62(value: u128, width: usize) -> String {
    let modulus = 62u128.pow(width as u32);
    let mut value = value % modulus;
    let mut out = vec![b'0'; width];
    for slot in out.iter_mut().rev() {
        *slot = ALPHABET[(value % 62) as usize];
        value /= 62;
        if value == 0 {
            break;
        }
    }
    out.iter().map(|&b| char::from(b)).collect()
}

/// 4-char digest of the hostname.
///
/// SHA-256 rather than the runtime hash so the tag is identical across
/// restarts and toolchain versions.
fn host_tag() -> String {
    let name = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_owned());
    let digest = Sha256::digest(name.as_bytes());
    let mut folded = [0u8; 8];
    folded.copy_from_slice(&digest[..8]);
    base62(u128::from(u64::from_be_bytes(folded)), HOST_TAG_WIDTH)
}

/// 11-char process tag: epoch seconds then 64 bits of startup randomness.
fn process_tag() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let random = uuid::Uuid::new_v4().as_u128() as u64;
    format!(
        "{}{}",
        base62(u128::from(secs), TIMESTAMP_WIDTH),
        base62(u128::from(random), RANDOM_WIDTH)
    )
}
