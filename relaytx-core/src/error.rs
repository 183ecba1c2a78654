//! Typed error hierarchy for the RelayTx protocol (§7).
//!
//! Every fallible operation returns `Result<T, RelayError>`. No panics on
//! invalid input — errors are typed and, where recoverable, handled locally
//! rather than treated as fatal to the transfer.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for the RelayTx protocol.
#[derive(Debug, Error)]
pub enum RelayError {
    // ── Framer errors (§7 MalformedFrame) ───────────────────────────
    /// Header decode failed, or `size`/length fields are inconsistent.
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),

    // ── Hasher errors (§7 HashMismatchChunk / HashMismatchFile) ─────
    /// A chunk's payload hash did not match its header hash.
    #[error("chunk hash mismatch: sequence {sequence}")]
    HashMismatchChunk { sequence: u32 },

    /// The assembled file's hash did not match the manifest's `fileHash`.
    #[error("file hash mismatch: expected {expected}, got {actual}")]
    HashMismatchFile { expected: String, actual: String },

    // ── Gap (§7 Gap) ─────────────────────────────────────────────────
    /// One or more sequences are missing and could not be closed by resend.
    #[error("gap never closed: {0:?}")]
    UnclosedGap(Vec<u32>),

    // ── Channel errors (§7 ChannelClosed / SendTransient) ───────────
    /// The channel reported it is not open, or entered a closed/failed state.
    #[error("channel closed")]
    ChannelClosed,

    /// A transient send-time error; caller should apply the retry policy.
    #[error("transient send error: {0}")]
    SendTransient(String),

    // ── Spool errors (§7 SpoolError) ─────────────────────────────────
    /// The durable store failed a read or write.
    #[error("spool error: {0}")]
    Spool(String),

    // ── Cancellation (§7 Cancelled) ──────────────────────────────────
    /// User or supervisor cancellation. Not a failure in itself.
    #[error("transfer cancelled")]
    Cancelled,

    // ── Protocol errors (§7 Protocol) ─────────────────────────────────
    /// Unexpected message type, bad protocol version, or sequence out of range.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// The peer's manifest declared an unsupported protocol version.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u32),

    /// Final assembly could not produce a contiguous file.
    #[error("assembly error: {0}")]
    Assembly(&'static str),

    // ── Plumbing ──────────────────────────────────────────────────────
    /// The underlying I/O layer reported an error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode of a control message failed.
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    /// An mpsc channel used internally was closed unexpectedly.
    #[error("internal channel closed")]
    InternalChannelClosed,

    /// A background task failed.
    #[error("task error: {0}")]
    Task(#[from] TaskError),
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for RelayError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        RelayError::InternalChannelClosed
    }
}

// ── TaskError ─────────────────────────────────────────────────────

/// Typed error for spawned background work (hashing, spool I/O).
#[derive(Debug, Error)]
pub enum TaskError {
    /// The task exceeded its deadline and was cancelled.
    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    /// The task was explicitly cancelled via its `CancellationToken`.
    #[error("task was cancelled")]
    Cancelled,

    /// The task's work returned an I/O error.
    #[error("task i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic task failure with a human-readable message.
    #[error("task failed: {0}")]
    Failed(String),
}
