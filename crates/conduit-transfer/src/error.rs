use std::io;
use std::time::Duration;

use conduit_types::{ChunkId, SessionState};
use thiserror::Error;

/// A chunk payload that is not valid base64.
#[derive(Debug, Error)]
#[error("malformed chunk payload ({payload_len} bytes)")]
pub struct DecodeError {
    pub payload_len: usize,
    #[source]
    pub source: base64::DecodeError,
}

/// No acknowledgment arrived before the chunk's deadline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no acknowledgment for chunk {id} before its deadline")]
pub struct AckTimeoutError {
    pub id: ChunkId,
}

/// An id was tracked while a previous ack for it was still pending.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("chunk id {0} is already awaiting an acknowledgment")]
pub struct DuplicateAckId(pub ChunkId);

/// The channel refused a message.
#[derive(Debug, Error)]
pub enum ChannelSendError {
    #[error("channel closed by peer")]
    Closed,
    #[error("failed to serialize {kind} message")]
    Serialize {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure reported by a [`ChunkSink`](crate::io::ChunkSink).
#[derive(Debug, Error)]
pub enum SinkError {
    /// Temporary backpressure; the write should be retried later.
    #[error("sink is not accepting writes")]
    Busy,
    #[error("sink I/O failed")]
    Io(#[from] io::Error),
}

impl SinkError {
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid session transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

/// Why a session ended in `Failed`.
#[derive(Debug, Error)]
pub enum AbortCause {
    #[error("chunk {seq} unacknowledged after {attempts} attempts")]
    AckRetriesExhausted {
        seq: u64,
        attempts: u32,
        #[source]
        source: AckTimeoutError,
    },
    #[error("sink write failed after {attempts} attempts")]
    SinkWrite {
        attempts: u32,
        #[source]
        source: SinkError,
    },
    #[error("failed to close sink")]
    SinkClose(#[source] SinkError),
    #[error(transparent)]
    ChannelSend(#[from] ChannelSendError),
    #[error("channel closed before the session finished")]
    ChannelClosed,
    #[error("peer aborted the transfer: {}", .reason.as_deref().unwrap_or("no reason given"))]
    PeerAborted { reason: Option<String> },
    #[error("source read failed")]
    SourceRead(#[source] io::Error),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("stream digest mismatch (expected {expected}, computed {actual})")]
    DigestMismatch { expected: String, actual: String },
    #[error("peer did not confirm closure within {0:?}")]
    CloseTimeout(Duration),
    #[error(transparent)]
    DuplicateAckId(#[from] DuplicateAckId),
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

impl AbortCause {
    /// Whether the peer should be told about this failure. Not when the peer
    /// started it, and not when the channel itself is gone.
    pub fn notify_peer(&self) -> bool {
        !matches!(
            self,
            Self::PeerAborted { .. } | Self::ChannelClosed | Self::ChannelSend(ChannelSendError::Closed)
        )
    }
}

/// Terminal error of a session, carrying the originating cause.
#[derive(Debug, Error)]
#[error("transfer aborted: {cause}")]
pub struct TransferAborted {
    #[source]
    pub cause: AbortCause,
}

impl From<AbortCause> for TransferAborted {
    fn from(cause: AbortCause) -> Self {
        Self { cause }
    }
}
