/// Shared types for the conduit transfer protocol: the wire messages both
/// contexts exchange and the session models reported to callers.

pub mod messages;
pub mod models;

pub use messages::{ChannelMessage, ChunkId};
pub use models::{SessionState, TransferStats};
