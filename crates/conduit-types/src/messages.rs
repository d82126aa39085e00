use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier of one in-flight chunk.
///
/// Generated fresh for every send (retries included), so an id is never
/// reused within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(String);

impl ChunkId {
    /// A new random id (UUID v4, simple form).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ChunkId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ChunkId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Messages exchanged between the two contexts over the asynchronous channel.
///
/// Serialized as flat JSON objects tagged by `type`, e.g.
/// `{"type":"stream-chunk","id":"…","chunk":"aGVsbG8="}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChannelMessage {
    /// Receiver side asks the sender side to begin a session.
    StartTransfer,

    /// Sender accepted the start signal and is streaming.
    StreamReady,

    /// One chunk envelope; `chunk` is the base64 payload.
    ///
    /// `seq` is the logical position of the chunk in the stream. A re-send
    /// carries a fresh `id` but the same `seq`.
    StreamChunk {
        id: ChunkId,
        chunk: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },

    /// Acknowledges the envelope with this id.
    ChunkAck { id: ChunkId },

    /// No more chunks follow. `digest` is the hex SHA-256 of every byte sent.
    StreamEnd {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        digest: Option<String>,
    },

    /// The receiver drained its queue and closed its sink.
    StreamClosed { bytes: u64 },

    /// Session failure; the peer discards all state for the session.
    Abort {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl ChannelMessage {
    /// Wire name of the message type, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StartTransfer => "start-transfer",
            Self::StreamReady => "stream-ready",
            Self::StreamChunk { .. } => "stream-chunk",
            Self::ChunkAck { .. } => "chunk-ack",
            Self::StreamEnd { .. } => "stream-end",
            Self::StreamClosed { .. } => "stream-closed",
            Self::Abort { .. } => "abort",
        }
    }

    pub fn abort(reason: impl Into<String>) -> Self {
        Self::Abort {
            reason: Some(reason.into()),
        }
    }
}
