/// Transfer logging trait for structured event reporting.
///
/// Transports and coordinators report protocol events through a
/// [`TransferLogger`] so hosts can forward them to a status display, record them
/// in tests, or just hand them to `tracing`.

use std::fmt;

use conduit_types::{ChunkId, SessionState};

/// Structured log entry for a transfer operation.
#[derive(Debug, Clone)]
pub struct TransferLog {
    pub component: &'static str,
    /// Session generation on this endpoint; increments on every reuse.
    pub session: u32,
    pub event: TransferEvent,
}

/// Transfer events that can be logged.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// Sender: chunk posted to the channel
    ChunkSent {
        seq: u64,
        id: ChunkId,
        size: usize,
        attempt: u32,
    },
    /// Sender: chunk held back because the window is full
    ChunkDeferred { seq: u64, pending: usize },
    /// Sender: ack received
    ChunkAcked { seq: u64, rtt_ms: u64 },
    /// Sender: ack deadline passed
    AckTimedOut { seq: u64, id: ChunkId, attempt: u32 },
    /// Sender: ack for an id that is no longer pending
    StaleAck { id: ChunkId },
    /// Receiver: chunk parked in the backpressure queue
    ChunkQueued { id: ChunkId, queue_len: usize },
    /// Receiver: chunk handed to the sink and acknowledged
    ChunkWritten { id: ChunkId, size: usize },
    /// Receiver: re-sent copy of a chunk already written or queued
    DuplicateChunk { seq: u64, id: ChunkId },
    /// Receiver: sink refused a write
    SinkBusy { queue_len: usize },
    /// Receiver: sink write failed, will retry
    SinkWriteFailed { attempt: u32, message: String },
    /// Receiver: payload could not be decoded
    DecodeFailed { id: ChunkId, message: String },
    /// Receiver: end-of-stream digest comparison
    DigestChecked { matched: bool },
    /// Session state transition
    StateChanged { from: SessionState, to: SessionState },
    /// Transfer complete
    TransferComplete {
        total_bytes: u64,
        chunks: u64,
        duration_ms: u64,
        retries: u64,
    },
    /// Transfer failed
    TransferFailed { message: String },
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChunkSent { seq, id, size, attempt } => {
                write!(f, "chunk_sent seq={} id={} size={} attempt={}", seq, id, size, attempt)
            }
            Self::ChunkDeferred { seq, pending } => {
                write!(f, "chunk_deferred seq={} pending={}", seq, pending)
            }
            Self::ChunkAcked { seq, rtt_ms } => {
                write!(f, "chunk_acked seq={} rtt_ms={}", seq, rtt_ms)
            }
            Self::AckTimedOut { seq, id, attempt } => {
                write!(f, "ack_timed_out seq={} id={} attempt={}", seq, id, attempt)
            }
            Self::StaleAck { id } => write!(f, "stale_ack id={}", id),
            Self::ChunkQueued { id, queue_len } => {
                write!(f, "chunk_queued id={} queue_len={}", id, queue_len)
            }
            Self::ChunkWritten { id, size } => {
                write!(f, "chunk_written id={} size={}", id, size)
            }
            Self::DuplicateChunk { seq, id } => {
                write!(f, "duplicate_chunk seq={} id={}", seq, id)
            }
            Self::SinkBusy { queue_len } => write!(f, "sink_busy queue_len={}", queue_len),
            Self::SinkWriteFailed { attempt, message } => {
                write!(f, "sink_write_failed attempt={}: {}", attempt, message)
            }
            Self::DecodeFailed { id, message } => {
                write!(f, "decode_failed id={}: {}", id, message)
            }
            Self::DigestChecked { matched } => write!(f, "digest_checked matched={}", matched),
            Self::StateChanged { from, to } => write!(f, "state {} -> {}", from, to),
            Self::TransferComplete { total_bytes, chunks, duration_ms, retries } => {
                write!(
                    f,
                    "transfer_complete bytes={} chunks={} duration_ms={} retries={}",
                    total_bytes, chunks, duration_ms, retries
                )
            }
            Self::TransferFailed { message } => write!(f, "transfer_failed: {}", message),
        }
    }
}

/// Trait for transfer logging. Implementations can forward logs to a UI,
/// write to tracing, or discard them.
pub trait TransferLogger: Send + Sync {
    fn log(&self, entry: TransferLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl TransferLogger for TracingLogger {
    fn log(&self, entry: TransferLog) {
        // info for lifecycle events, warn for absorbed failures, debug for per-chunk spam
        match &entry.event {
            TransferEvent::StateChanged { .. }
            | TransferEvent::DigestChecked { .. }
            | TransferEvent::TransferComplete { .. } => {
                tracing::info!(
                    component = entry.component,
                    session = entry.session,
                    "{}",
                    entry.event,
                );
            }
            TransferEvent::AckTimedOut { .. }
            | TransferEvent::SinkWriteFailed { .. }
            | TransferEvent::DecodeFailed { .. }
            | TransferEvent::TransferFailed { .. } => {
                tracing::warn!(
                    component = entry.component,
                    session = entry.session,
                    "{}",
                    entry.event,
                );
            }
            _ => {
                tracing::debug!(
                    component = entry.component,
                    session = entry.session,
                    "{}",
                    entry.event,
                );
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl TransferLogger for NullLogger {
    fn log(&self, _entry: TransferLog) {}
}
