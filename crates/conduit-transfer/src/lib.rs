/// Conduit transfer: reliable chunked byte streams between isolated contexts.
///
/// Two contexts that share no memory exchange JSON messages over an
/// asynchronous channel. This crate provides:
/// - flow-controlled sender with a bounded window of unacknowledged chunks
/// - ack tracking with per-chunk deadlines and a single re-send
/// - ordered receiver with a backpressure queue in front of the sink
/// - session lifecycle with reuse over the same channel
/// - SHA-256 end-to-end integrity check

pub mod ack;
pub mod channel;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod io;
pub mod logging;
pub mod receiver;
pub mod sender;
pub mod session;

// Re-export key types for convenience.
pub use ack::{AckOutcome, AckTracker, AckWaiter, DEFAULT_ACK_TIMEOUT};
pub use channel::{message_channel, Inbox, Outbound, Port, PortSender};
pub use config::{ConfigError, TransferConfig, DEFAULT_CHUNK_SIZE, DEFAULT_WINDOW};
pub use coordinator::{ReceiverCoordinator, SenderCoordinator};
pub use error::{
    AbortCause, AckTimeoutError, ChannelSendError, DecodeError, DuplicateAckId,
    InvalidTransition, SinkError, TransferAborted,
};
pub use io::{ChunkSink, ChunkSource, FileSink, FileSource, MemorySink, MemorySource};
pub use logging::{NullLogger, TracingLogger, TransferEvent, TransferLog, TransferLogger};
pub use receiver::ReceiverTransport;
pub use sender::{SenderTransport, Submit};
pub use session::{Session, SessionProgress};
