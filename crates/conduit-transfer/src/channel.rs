/// The message channel between the two contexts.
///
/// The protocol only needs an injected send half ([`Outbound`]) and a receive
/// half ([`Inbox`]). [`message_channel`] builds an in-process duplex pair whose
/// ports carry serialized JSON text, so every message crosses the boundary the
/// same way it would between isolated contexts.

use conduit_types::ChannelMessage;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::error::ChannelSendError;

/// Send half of a channel endpoint.
pub trait Outbound: Send + Sync {
    fn post(&self, message: &ChannelMessage) -> Result<(), ChannelSendError>;
}

/// Sender handle of one port. Cheap to clone.
#[derive(Clone)]
pub struct PortSender {
    tx: mpsc::UnboundedSender<String>,
}

impl PortSender {
    /// Post already-serialized text, e.g. when bridging from another transport.
    pub fn post_raw(&self, text: String) -> Result<(), ChannelSendError> {
        self.tx.send(text).map_err(|_| ChannelSendError::Closed)
    }
}

impl Outbound for PortSender {
    fn post(&self, message: &ChannelMessage) -> Result<(), ChannelSendError> {
        let text = serde_json::to_string(message).map_err(|source| {
            ChannelSendError::Serialize {
                kind: message.kind(),
                source,
            }
        })?;
        trace!(kind = message.kind(), len = text.len(), "posting message");
        self.post_raw(text)
    }
}

/// Receive half of a channel endpoint.
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<String>,
}

impl Inbox {
    /// Next well-formed message, or `None` once the peer port is gone.
    ///
    /// Text that does not parse as a [`ChannelMessage`] is logged and skipped.
    /// Cancel-safe: nothing is consumed unless a message is returned or dropped
    /// as malformed.
    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        loop {
            let text = self.rx.recv().await?;
            if let Some(message) = parse(&text) {
                return Some(message);
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<ChannelMessage> {
        while let Ok(text) = self.rx.try_recv() {
            if let Some(message) = parse(&text) {
                return Some(message);
            }
        }
        None
    }
}

fn parse(text: &str) -> Option<ChannelMessage> {
    match serde_json::from_str(text) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(error = %e, len = text.len(), "discarding malformed channel message");
            None
        }
    }
}

/// One end of a duplex channel.
pub struct Port {
    pub sender: PortSender,
    pub inbox: Inbox,
}

impl Port {
    pub fn split(self) -> (PortSender, Inbox) {
        (self.sender, self.inbox)
    }
}

/// Create a connected pair of ports.
pub fn message_channel() -> (Port, Port) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        Port {
            sender: PortSender { tx: b_tx },
            inbox: Inbox { rx: a_rx },
        },
        Port {
            sender: PortSender { tx: a_tx },
            inbox: Inbox { rx: b_rx },
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_types::ChunkId;

    #[tokio::test]
    async fn messages_cross_in_order() {
        let (a, mut b) = message_channel();
        a.sender.post(&ChannelMessage::StartTransfer).unwrap();
        a.sender
            .post(&ChannelMessage::ChunkAck {
                id: ChunkId::from("1"),
            })
            .unwrap();

        assert_eq!(b.inbox.recv().await, Some(ChannelMessage::StartTransfer));
        assert_eq!(
            b.inbox.recv().await,
            Some(ChannelMessage::ChunkAck {
                id: ChunkId::from("1")
            })
        );
    }

    #[tokio::test]
    async fn malformed_text_is_skipped() {
        let (a, mut b) = message_channel();
        a.sender.post_raw("{not json".into()).unwrap();
        a.sender.post_raw(r#"{"type":"bogus"}"#.into()).unwrap();
        a.sender.post(&ChannelMessage::StreamReady).unwrap();

        assert_eq!(b.inbox.recv().await, Some(ChannelMessage::StreamReady));
    }

    #[tokio::test]
    async fn closed_peer_fails_send_and_ends_inbox() {
        let (a, b) = message_channel();
        let (b_sender, b_inbox) = b.split();
        drop(b_inbox);
        assert!(matches!(
            a.sender.post(&ChannelMessage::StreamReady),
            Err(ChannelSendError::Closed)
        ));

        let (_a_sender, mut a_inbox) = a.split();
        drop(b_sender);
        assert_eq!(a_inbox.recv().await, None);
    }
}
