use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Lifecycle of one transfer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Starting,
    Transferring,
    Draining,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Compact encoding for atomic progress counters.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Starting => 1,
            Self::Transferring => 2,
            Self::Draining => 3,
            Self::Completed => 4,
            Self::Failed => 5,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Idle,
            1 => Self::Starting,
            2 => Self::Transferring,
            3 => Self::Draining,
            4 => Self::Completed,
            5 => Self::Failed,
            _ => return None,
        })
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Transferring => "transferring",
            Self::Draining => "draining",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Summary of a transfer, reported on completion and readable while running.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStats {
    /// Payload bytes acknowledged (sender) or written to the sink (receiver).
    pub bytes_transferred: u64,
    pub chunks: u64,
    /// Chunks re-sent after an ack timeout.
    pub retries: u64,
    /// Largest backpressure queue length seen by the receiver.
    pub peak_queue: u64,
    /// `None` when the peer sent no digest.
    pub digest_verified: Option<bool>,
    pub elapsed: Duration,
}

impl TransferStats {
    /// Average rate over the session in KiB/s; zero before any time has passed.
    pub fn throughput_kib(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.bytes_transferred as f64 / 1024.0 / secs
    }
}
