/// Ordered, backpressure-aware sink writer.
///
/// ```text
/// stream-chunk --> decode --> [queue empty?] --yes--> sink.write --ok--> chunk-ack
///                                  | no                   | busy / failed
///                                  v                      v
///                           BackpressureQueue <-----------+
///                                  ^   retry after write_retry_delay
/// ```
///
/// Chunks reach the sink in arrival order. A chunk is acknowledged only after
/// the sink accepted it. A re-sent copy of a chunk (same `seq`, fresh id) is
/// never written twice: copies of a written chunk are acked straight away,
/// copies of a queued chunk take over its place in the queue.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use conduit_types::{ChannelMessage, ChunkId, SessionState};
use sha2::{Digest, Sha256};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::channel::{Inbox, Outbound};
use crate::codec;
use crate::config::TransferConfig;
use crate::error::{AbortCause, SinkError};
use crate::io::ChunkSink;
use crate::logging::{TransferEvent, TransferLog, TransferLogger};
use crate::session::{Session, SessionProgress};

const COMPONENT: &str = "receiver";

/// A decoded chunk waiting for the sink.
struct Pending {
    id: ChunkId,
    seq: Option<u64>,
    chunk: Bytes,
}

pub struct ReceiverTransport<S> {
    sink: S,
    outbound: Arc<dyn Outbound>,
    config: TransferConfig,
    queue: VecDeque<Pending>,
    /// Sequence numbers the sink has accepted this session.
    delivered: HashSet<u64>,
    peak_queue: usize,
    /// Consecutive `SinkError::Io` failures; any successful write clears it.
    failures: u32,
    retry_at: Option<Instant>,
    hasher: Sha256,
    written: u64,
    progress: Arc<SessionProgress>,
    logger: Option<Arc<dyn TransferLogger>>,
    session: u32,
}

impl<S: ChunkSink> ReceiverTransport<S> {
    pub fn new(sink: S, outbound: Arc<dyn Outbound>, config: TransferConfig) -> Self {
        Self {
            sink,
            outbound,
            config,
            queue: VecDeque::new(),
            delivered: HashSet::new(),
            peak_queue: 0,
            failures: 0,
            retry_at: None,
            hasher: Sha256::new(),
            written: 0,
            progress: Arc::new(SessionProgress::new()),
            logger: None,
            session: 0,
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn TransferLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn peak_queue(&self) -> usize {
        self.peak_queue
    }

    /// Bytes the sink has accepted in the current session.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Bind a new sink for the next transfer, returning the previous one.
    /// Queue, counters and digest start over; the channel is untouched.
    pub fn reset(&mut self, sink: S) -> S {
        self.queue.clear();
        self.delivered.clear();
        self.peak_queue = 0;
        self.failures = 0;
        self.retry_at = None;
        self.hasher = Sha256::new();
        self.written = 0;
        std::mem::replace(&mut self.sink, sink)
    }

    /// Receive the stream until `stream-end` has been processed: queue drained,
    /// sink closed, digest checked and `stream-closed` posted.
    ///
    /// Chunks and `stream-end` seen before the peer's `stream-ready` belong to
    /// an earlier session and are dropped.
    ///
    /// Moves `session` to `Transferring` on the first chunk and to `Draining`
    /// on `stream-end`. On error the queue is discarded.
    pub async fn run(&mut self, inbox: &mut Inbox, session: &mut Session) -> Result<(), AbortCause> {
        self.progress = session.progress();
        self.session = session.generation();

        let result = self.receive(inbox, session).await;
        if result.is_err() {
            let discarded = self.queue.len();
            self.queue.clear();
            self.retry_at = None;
            if discarded > 0 {
                debug!(session = self.session, discarded, "dropped queued chunks");
            }
        }
        result
    }

    async fn receive(&mut self, inbox: &mut Inbox, session: &mut Session) -> Result<(), AbortCause> {
        // Set by stream-end; holds the sender's digest.
        let mut end: Option<Option<String>> = None;
        let mut ready = false;

        loop {
            if self.queue.is_empty() {
                if let Some(expected) = end.take() {
                    return self.close(expected).await;
                }
            }

            let retry_at = self.retry_at;

            tokio::select! {
                biased;

                message = inbox.recv() => match message {
                    Some(stale @ (ChannelMessage::StreamChunk { .. } | ChannelMessage::StreamEnd { .. }))
                        if !ready =>
                    {
                        debug!(session = self.session, kind = stale.kind(), "dropping message sent before stream-ready");
                    }
                    Some(ChannelMessage::StreamChunk { id, chunk, seq }) => {
                        if session.state() == SessionState::Starting {
                            session.advance(SessionState::Transferring, COMPONENT, self.logger.as_ref())?;
                        }
                        if end.is_some() {
                            warn!(session = self.session, %id, "chunk arrived after stream-end");
                        }
                        self.on_chunk(id, seq, &chunk).await?;
                    }
                    Some(ChannelMessage::StreamEnd { digest }) => {
                        if session.state() == SessionState::Transferring {
                            session.advance(SessionState::Draining, COMPONENT, self.logger.as_ref())?;
                        }
                        debug!(session = self.session, queued = self.queue.len(), "stream end received, draining");
                        end = Some(digest);
                    }
                    Some(ChannelMessage::StreamReady) => {
                        info!(session = self.session, "sender is streaming");
                        ready = true;
                    }
                    Some(ChannelMessage::Abort { reason }) => {
                        return Err(AbortCause::PeerAborted { reason });
                    }
                    Some(other) => {
                        debug!(session = self.session, kind = other.kind(), "ignoring message while receiving");
                    }
                    None => return Err(AbortCause::ChannelClosed),
                },

                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.flush_queue().await?;
                }
            }
        }
    }

    async fn on_chunk(&mut self, id: ChunkId, seq: Option<u64>, payload: &str) -> Result<(), AbortCause> {
        if let Some(seq) = seq {
            if self.delivered.contains(&seq) {
                debug!(session = self.session, seq, %id, "copy of a written chunk, acking");
                self.log(TransferEvent::DuplicateChunk { seq, id: id.clone() });
                self.outbound.post(&ChannelMessage::ChunkAck { id })?;
                return Ok(());
            }
            if let Some(queued) = self.queue.iter_mut().find(|queued| queued.seq == Some(seq)) {
                // The ack goes to the newest id; the sender gave up on the old one.
                debug!(session = self.session, seq, %id, replaces = %queued.id, "copy of a queued chunk");
                queued.id = id.clone();
                self.log(TransferEvent::DuplicateChunk { seq, id });
                return Ok(());
            }
        }

        let chunk = match codec::decode(payload) {
            Ok(chunk) => chunk,
            Err(e) if self.config.strict => return Err(e.into()),
            Err(e) => {
                warn!(session = self.session, %id, error = %e, "undecodable chunk replaced with empty content");
                self.log(TransferEvent::DecodeFailed {
                    id: id.clone(),
                    message: e.to_string(),
                });
                Bytes::new()
            }
        };

        let pending = Pending { id, seq, chunk };

        // Never overtake chunks already waiting.
        if !self.queue.is_empty() {
            self.enqueue(pending);
            return Ok(());
        }

        if !self.try_write(&pending).await? {
            self.enqueue(pending);
            self.arm_retry();
        }
        Ok(())
    }

    fn enqueue(&mut self, pending: Pending) {
        let id = pending.id.clone();
        self.queue.push_back(pending);
        let queue_len = self.queue.len();
        self.peak_queue = self.peak_queue.max(queue_len);
        self.progress.observe_queue(queue_len);
        self.log(TransferEvent::ChunkQueued { id, queue_len });
    }

    fn arm_retry(&mut self) {
        if self.retry_at.is_none() {
            self.retry_at = Some(Instant::now() + self.config.write_retry_delay);
        }
    }

    /// Write queued chunks head-first until the queue is empty or the sink
    /// refuses again.
    async fn flush_queue(&mut self) -> Result<(), AbortCause> {
        self.retry_at = None;
        while let Some(pending) = self.queue.pop_front() {
            if !self.try_write(&pending).await? {
                self.queue.push_front(pending);
                self.arm_retry();
                break;
            }
        }
        Ok(())
    }

    /// `Ok(true)` once the sink accepted the chunk and the ack is posted;
    /// `Ok(false)` when the chunk has to wait.
    async fn try_write(&mut self, pending: &Pending) -> Result<bool, AbortCause> {
        let Pending { id, seq, chunk } = pending;
        match self.sink.write(chunk.clone()).await {
            Ok(()) => {
                self.failures = 0;
                if let Some(seq) = seq {
                    self.delivered.insert(*seq);
                }
                self.hasher.update(chunk);
                self.written += chunk.len() as u64;
                self.progress.record_chunk(chunk.len());
                self.log(TransferEvent::ChunkWritten {
                    id: id.clone(),
                    size: chunk.len(),
                });
                self.outbound.post(&ChannelMessage::ChunkAck { id: id.clone() })?;
                Ok(true)
            }
            Err(SinkError::Busy) => {
                self.log(TransferEvent::SinkBusy {
                    queue_len: self.queue.len() + 1,
                });
                Ok(false)
            }
            Err(source) => {
                self.failures += 1;
                if self.failures > self.config.sink_write_retries {
                    return Err(AbortCause::SinkWrite {
                        attempts: self.failures,
                        source,
                    });
                }
                warn!(session = self.session, %id, attempt = self.failures, error = %source, "sink write failed");
                self.log(TransferEvent::SinkWriteFailed {
                    attempt: self.failures,
                    message: source.to_string(),
                });
                Ok(false)
            }
        }
    }

    async fn close(&mut self, expected: Option<String>) -> Result<(), AbortCause> {
        self.sink.close().await.map_err(AbortCause::SinkClose)?;

        let actual = hex::encode(std::mem::take(&mut self.hasher).finalize());
        let verified = expected.as_deref().map(|expected| expected.eq_ignore_ascii_case(&actual));
        self.progress.record_digest(verified);
        if let Some(matched) = verified {
            self.log(TransferEvent::DigestChecked { matched });
        }
        if verified == Some(false) {
            let expected = expected.unwrap_or_default();
            if self.config.strict {
                return Err(AbortCause::DigestMismatch { expected, actual });
            }
            warn!(session = self.session, %expected, %actual, "stream digest mismatch");
        }

        self.outbound.post(&ChannelMessage::StreamClosed {
            bytes: self.written,
        })?;
        debug!(session = self.session, bytes = self.written, "sink closed");
        Ok(())
    }

    fn log(&self, event: TransferEvent) {
        if let Some(ref logger) = self.logger {
            logger.log(TransferLog {
                component: COMPONENT,
                session: self.session,
                event,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{message_channel, Port};
    use crate::io::MemorySink;
    use std::io;
    use std::time::Duration;

    /// Refuses the first `busy` writes, then fails `failing` more with an I/O error.
    #[derive(Default)]
    struct FlakySink {
        busy: u32,
        failing: u32,
        attempts: u32,
        inner: MemorySink,
    }

    impl ChunkSink for FlakySink {
        async fn write(&mut self, chunk: Bytes) -> Result<(), SinkError> {
            self.attempts += 1;
            if self.busy > 0 {
                self.busy -= 1;
                return Err(SinkError::Busy);
            }
            if self.failing > 0 {
                self.failing -= 1;
                return Err(io::Error::other("disk on fire").into());
            }
            self.inner.write(chunk).await
        }

        async fn close(&mut self) -> Result<(), SinkError> {
            self.inner.close().await
        }
    }

    fn setup<S: ChunkSink>(sink: S, config: TransferConfig) -> (ReceiverTransport<S>, Inbox, Port, Session) {
        let (ours, theirs) = message_channel();
        let (tx, inbox) = ours.split();
        let mut session = Session::new();
        session.transition(SessionState::Starting).unwrap();
        theirs.sender.post(&ChannelMessage::StreamReady).unwrap();
        (ReceiverTransport::new(sink, Arc::new(tx), config), inbox, theirs, session)
    }

    fn chunk(id: &str, seq: Option<u64>, payload: &[u8]) -> ChannelMessage {
        ChannelMessage::StreamChunk {
            id: ChunkId::from(id),
            chunk: codec::encode(payload),
            seq,
        }
    }

    fn post_stream(peer: &Port, chunks: &[&[u8]], digest: Option<String>) {
        for (i, chunk) in chunks.iter().enumerate() {
            peer.sender
                .post(&ChannelMessage::StreamChunk {
                    id: ChunkId::from(format!("c{}", i)),
                    chunk: codec::encode(chunk),
                    seq: Some(i as u64),
                })
                .unwrap();
        }
        peer.sender.post(&ChannelMessage::StreamEnd { digest }).unwrap();
    }

    fn drain(peer: &mut Port) -> Vec<ChannelMessage> {
        std::iter::from_fn(|| peer.inbox.try_recv()).collect()
    }

    #[tokio::test]
    async fn writes_acks_and_closes() {
        let (mut receiver, mut inbox, mut peer, mut session) =
            setup(MemorySink::new(), TransferConfig::default());
        post_stream(&peer, &[b"hello ", b"world"], None);

        receiver.run(&mut inbox, &mut session).await.unwrap();

        assert_eq!(receiver.sink().concat(), b"hello world");
        assert!(receiver.sink().is_closed());
        assert_eq!(
            drain(&mut peer),
            vec![
                ChannelMessage::ChunkAck { id: ChunkId::from("c0") },
                ChannelMessage::ChunkAck { id: ChunkId::from("c1") },
                ChannelMessage::StreamClosed { bytes: 11 },
            ]
        );
        assert_eq!(session.state(), SessionState::Draining);
        assert_eq!(session.progress().stats().digest_verified, None);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_sink_queues_in_order() {
        let sink = FlakySink {
            busy: 3,
            ..Default::default()
        };
        let (mut receiver, mut inbox, peer, mut session) = setup(sink, TransferConfig::default());
        post_stream(&peer, &[b"a", b"b", b"c", b"d"], None);

        receiver.run(&mut inbox, &mut session).await.unwrap();

        assert_eq!(receiver.sink().inner.concat(), b"abcd");
        assert_eq!(receiver.peak_queue(), 4);
        assert_eq!(receiver.queue_len(), 0);
        // Busy refusals do not count as failures.
        assert_eq!(receiver.sink().attempts, 3 + 4);
    }

    #[tokio::test(start_paused = true)]
    async fn io_failures_within_budget_are_retried() {
        let sink = FlakySink {
            failing: 2,
            ..Default::default()
        };
        let config = TransferConfig::default().with_sink_write_retries(2);
        let (mut receiver, mut inbox, peer, mut session) = setup(sink, config);
        post_stream(&peer, &[b"x"], None);

        receiver.run(&mut inbox, &mut session).await.unwrap();
        assert_eq!(receiver.sink().inner.concat(), b"x");
    }

    #[tokio::test(start_paused = true)]
    async fn io_failures_past_budget_abort() {
        let sink = FlakySink {
            failing: u32::MAX,
            ..Default::default()
        };
        let config = TransferConfig::default().with_sink_write_retries(2);
        let (mut receiver, mut inbox, peer, mut session) = setup(sink, config);
        post_stream(&peer, &[b"x", b"y"], None);

        let err = receiver.run(&mut inbox, &mut session).await.unwrap_err();
        assert!(matches!(err, AbortCause::SinkWrite { attempts: 3, .. }));
        assert_eq!(receiver.queue_len(), 0);
    }

    #[tokio::test]
    async fn bad_payload_becomes_empty_chunk() {
        let (mut receiver, mut inbox, mut peer, mut session) =
            setup(MemorySink::new(), TransferConfig::default());
        peer.sender
            .post(&ChannelMessage::StreamChunk {
                id: ChunkId::from("bad"),
                chunk: "***".into(),
                seq: None,
            })
            .unwrap();
        peer.sender.post(&ChannelMessage::StreamEnd { digest: None }).unwrap();

        receiver.run(&mut inbox, &mut session).await.unwrap();
        assert_eq!(receiver.sink().chunks(), &[Bytes::new()]);
        assert_eq!(
            drain(&mut peer)[0],
            ChannelMessage::ChunkAck { id: ChunkId::from("bad") }
        );
    }

    #[tokio::test]
    async fn bad_payload_is_fatal_when_strict() {
        let (mut receiver, mut inbox, peer, mut session) =
            setup(MemorySink::new(), TransferConfig::default().strict(true));
        peer.sender
            .post(&ChannelMessage::StreamChunk {
                id: ChunkId::from("bad"),
                chunk: "***".into(),
                seq: None,
            })
            .unwrap();

        let err = receiver.run(&mut inbox, &mut session).await.unwrap_err();
        assert!(matches!(err, AbortCause::Decode(_)));
    }

    #[tokio::test]
    async fn digest_is_verified() {
        let digest = hex::encode(Sha256::digest(b"abc"));
        let (mut receiver, mut inbox, peer, mut session) =
            setup(MemorySink::new(), TransferConfig::default());
        post_stream(&peer, &[b"a", b"bc"], Some(digest));

        receiver.run(&mut inbox, &mut session).await.unwrap();
        assert_eq!(session.progress().stats().digest_verified, Some(true));
    }

    #[tokio::test]
    async fn digest_mismatch_warns_or_aborts() {
        let wrong = hex::encode(Sha256::digest(b"something else"));

        let (mut receiver, mut inbox, peer, mut session) =
            setup(MemorySink::new(), TransferConfig::default());
        post_stream(&peer, &[b"abc"], Some(wrong.clone()));
        receiver.run(&mut inbox, &mut session).await.unwrap();
        assert_eq!(session.progress().stats().digest_verified, Some(false));

        let (mut receiver, mut inbox, peer, mut session) =
            setup(MemorySink::new(), TransferConfig::default().strict(true));
        post_stream(&peer, &[b"abc"], Some(wrong));
        let err = receiver.run(&mut inbox, &mut session).await.unwrap_err();
        assert!(matches!(err, AbortCause::DigestMismatch { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn abort_discards_queue() {
        let sink = FlakySink {
            busy: u32::MAX,
            ..Default::default()
        };
        let (mut receiver, mut inbox, peer, mut session) = setup(sink, TransferConfig::default());
        for i in 0..3 {
            peer.sender
                .post(&ChannelMessage::StreamChunk {
                    id: ChunkId::from(format!("c{}", i)),
                    chunk: codec::encode(b"data"),
                    seq: Some(i),
                })
                .unwrap();
        }
        let abort = peer.sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            abort.post(&ChannelMessage::abort("user cancelled")).unwrap();
        });

        let err = receiver.run(&mut inbox, &mut session).await.unwrap_err();
        assert!(matches!(err, AbortCause::PeerAborted { reason: Some(ref r) } if r == "user cancelled"));
        assert_eq!(receiver.queue_len(), 0);
        assert_eq!(receiver.peak_queue(), 3);
    }

    #[tokio::test]
    async fn reset_swaps_sink_and_counters() {
        let (mut receiver, mut inbox, peer, mut session) =
            setup(MemorySink::new(), TransferConfig::default());
        post_stream(&peer, &[b"first"], None);
        receiver.run(&mut inbox, &mut session).await.unwrap();

        let old = receiver.reset(MemorySink::new());
        assert_eq!(old.concat(), b"first");
        assert_eq!(receiver.bytes_written(), 0);
        assert!(receiver.sink().chunks().is_empty());
    }

    #[tokio::test]
    async fn copy_of_written_chunk_is_acked_not_rewritten() {
        let (mut receiver, mut inbox, mut peer, mut session) =
            setup(MemorySink::new(), TransferConfig::default());
        peer.sender.post(&chunk("first", Some(0), b"AAAA")).unwrap();
        peer.sender.post(&chunk("again", Some(0), b"AAAA")).unwrap();
        peer.sender.post(&chunk("next", Some(1), b"BBBB")).unwrap();
        peer.sender.post(&ChannelMessage::StreamEnd { digest: None }).unwrap();

        receiver.run(&mut inbox, &mut session).await.unwrap();

        assert_eq!(receiver.sink().concat(), b"AAAABBBB");
        assert_eq!(session.progress().stats().chunks, 2);
        let acked: Vec<_> = drain(&mut peer)
            .into_iter()
            .filter_map(|message| match message {
                ChannelMessage::ChunkAck { id } => Some(id),
                _ => None,
            })
            .collect();
        assert_eq!(acked, vec![ChunkId::from("first"), ChunkId::from("again"), ChunkId::from("next")]);
    }

    #[tokio::test(start_paused = true)]
    async fn copy_of_queued_chunk_takes_its_place() {
        let sink = FlakySink {
            busy: 5,
            ..Default::default()
        };
        let (mut receiver, mut inbox, mut peer, mut session) = setup(sink, TransferConfig::default());
        peer.sender.post(&chunk("old", Some(0), b"AAAA")).unwrap();
        peer.sender.post(&chunk("new", Some(0), b"AAAA")).unwrap();
        peer.sender.post(&ChannelMessage::StreamEnd { digest: None }).unwrap();

        receiver.run(&mut inbox, &mut session).await.unwrap();

        assert_eq!(receiver.sink().inner.concat(), b"AAAA");
        assert_eq!(receiver.peak_queue(), 1);
        assert_eq!(
            drain(&mut peer),
            vec![
                ChannelMessage::ChunkAck { id: ChunkId::from("new") },
                ChannelMessage::StreamClosed { bytes: 4 },
            ]
        );
    }

    #[tokio::test]
    async fn chunks_before_stream_ready_are_dropped() {
        let (ours, mut peer) = message_channel();
        let (tx, mut inbox) = ours.split();
        let mut session = Session::new();
        session.transition(SessionState::Starting).unwrap();
        let mut receiver = ReceiverTransport::new(MemorySink::new(), Arc::new(tx), TransferConfig::default());

        peer.sender.post(&chunk("leftover", Some(3), b"STALE")).unwrap();
        peer.sender.post(&ChannelMessage::StreamEnd { digest: None }).unwrap();
        peer.sender.post(&ChannelMessage::StreamReady).unwrap();
        peer.sender.post(&chunk("fresh", Some(0), b"fresh")).unwrap();
        peer.sender.post(&ChannelMessage::StreamEnd { digest: None }).unwrap();

        receiver.run(&mut inbox, &mut session).await.unwrap();

        assert_eq!(receiver.sink().concat(), b"fresh");
        assert_eq!(
            drain(&mut peer),
            vec![
                ChannelMessage::ChunkAck { id: ChunkId::from("fresh") },
                ChannelMessage::StreamClosed { bytes: 5 },
            ]
        );
    }
}
