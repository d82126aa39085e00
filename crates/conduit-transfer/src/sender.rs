/// Flow-controlled chunk emitter.
///
/// ```text
/// [Source task] --stage(1)--> [Sender loop] --stream-chunk--> peer
///  next_chunk()               window gate      <--chunk-ack--
///                             ack deadlines
/// ```
///
/// At most `window_limit` logical chunks are unacknowledged at any time. A chunk
/// whose ack deadline passes is re-sent under a fresh id; once its retry budget
/// is spent the session aborts.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use conduit_types::{ChannelMessage, ChunkId, SessionState};
use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::ack::{AckOutcome, AckTracker};
use crate::channel::{Inbox, Outbound};
use crate::codec;
use crate::config::TransferConfig;
use crate::error::{AbortCause, ChannelSendError};
use crate::io::ChunkSource;
use crate::logging::{TransferEvent, TransferLog, TransferLogger};
use crate::session::{Session, SessionProgress};

const COMPONENT: &str = "sender";

/// What [`SenderTransport::submit`] did with a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submit {
    /// Posted to the peer and tracked.
    Sent,
    /// Window full; held until acks free a slot. The producer should pause.
    Suspended,
}

/// One logical chunk awaiting its ack. Survives re-sends.
struct InFlight {
    seq: u64,
    id: ChunkId,
    attempt: u32,
    chunk: Bytes,
}

pub struct SenderTransport {
    outbound: Arc<dyn Outbound>,
    config: TransferConfig,
    tracker: AckTracker,
    in_flight: FuturesUnordered<BoxFuture<'static, (InFlight, AckOutcome)>>,
    /// Logical chunks sent and not yet acknowledged.
    outstanding: usize,
    pending: VecDeque<(u64, Bytes)>,
    next_seq: u64,
    hasher: Sha256,
    finished: bool,
    progress: Arc<SessionProgress>,
    logger: Option<Arc<dyn TransferLogger>>,
    session: u32,
}

impl SenderTransport {
    pub fn new(outbound: Arc<dyn Outbound>, config: TransferConfig) -> Self {
        let tracker = AckTracker::new(config.ack_timeout);
        Self {
            outbound,
            config,
            tracker,
            in_flight: FuturesUnordered::new(),
            outstanding: 0,
            pending: VecDeque::new(),
            next_seq: 0,
            hasher: Sha256::new(),
            finished: false,
            progress: Arc::new(SessionProgress::new()),
            logger: None,
            session: 0,
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn TransferLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// No chunk is unacknowledged and none is waiting for a window slot.
    pub fn is_drained(&self) -> bool {
        self.outstanding == 0 && self.pending.is_empty()
    }

    /// Hand one chunk to the transport.
    pub fn submit(&mut self, chunk: Bytes) -> Result<Submit, AbortCause> {
        self.hasher.update(&chunk);
        let seq = self.next_seq;
        self.next_seq += 1;

        if self.outstanding < self.config.window_limit && self.pending.is_empty() {
            self.outstanding += 1;
            self.send(seq, chunk, 1)?;
            return Ok(Submit::Sent);
        }

        self.pending.push_back((seq, chunk));
        self.log(TransferEvent::ChunkDeferred {
            seq,
            pending: self.pending.len(),
        });
        Ok(Submit::Suspended)
    }

    /// Post `stream-end` with the digest of everything submitted.
    ///
    /// Does nothing and returns `None` until the window has drained, or if the
    /// end was already signalled.
    pub fn finish(&mut self) -> Result<Option<String>, ChannelSendError> {
        if self.finished || !self.is_drained() {
            return Ok(None);
        }
        let digest = hex::encode(std::mem::take(&mut self.hasher).finalize());
        self.outbound.post(&ChannelMessage::StreamEnd {
            digest: Some(digest.clone()),
        })?;
        self.finished = true;
        debug!(session = self.session, chunks = self.next_seq, %digest, "stream end posted");
        Ok(Some(digest))
    }

    /// Stream `source` to the peer until every chunk is acknowledged and
    /// `stream-end` has been posted.
    ///
    /// Moves `session` to `Transferring` with the first chunk and to `Draining`
    /// once `stream-end` has been posted. A source that yields nothing leaves the
    /// session in `Starting`. On error every pending ack is cancelled and queued
    /// chunks are dropped; the caller decides what to tell the peer.
    pub async fn run<S: ChunkSource>(
        &mut self,
        source: S,
        inbox: &mut Inbox,
        session: &mut Session,
    ) -> Result<(), AbortCause> {
        self.progress = session.progress();
        self.session = session.generation();

        let (chunk_tx, chunk_rx) = mpsc::channel(1);
        let reader = ReaderTask(tokio::spawn(read_source(source, chunk_tx)));

        let result = self.drive(chunk_rx, inbox, session).await;
        drop(reader);
        if result.is_err() {
            self.teardown();
        }
        result
    }

    async fn drive(
        &mut self,
        mut chunk_rx: mpsc::Receiver<io::Result<Bytes>>,
        inbox: &mut Inbox,
        session: &mut Session,
    ) -> Result<(), AbortCause> {
        let mut exhausted = false;

        loop {
            if exhausted && self.is_drained() {
                self.finish()?;
                if session.state() == SessionState::Transferring {
                    session.advance(SessionState::Draining, COMPONENT, self.logger.as_ref())?;
                }
                return Ok(());
            }

            let deadline = self.tracker.next_deadline();
            let suspended = !self.pending.is_empty();

            tokio::select! {
                biased;

                message = inbox.recv() => match message {
                    Some(message) => self.handle_message(message)?,
                    None => return Err(AbortCause::ChannelClosed),
                },

                Some((flight, outcome)) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.complete(flight, outcome)?;
                }

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.tracker.expire(Instant::now());
                }

                next = chunk_rx.recv(), if !exhausted && !suspended => match next {
                    Some(Ok(chunk)) => {
                        if session.state() == SessionState::Starting {
                            session.advance(SessionState::Transferring, COMPONENT, self.logger.as_ref())?;
                        }
                        self.submit(chunk)?;
                    }
                    Some(Err(e)) => return Err(AbortCause::SourceRead(e)),
                    None => exhausted = true,
                },
            }
        }
    }

    fn handle_message(&mut self, message: ChannelMessage) -> Result<(), AbortCause> {
        match message {
            ChannelMessage::ChunkAck { id } => {
                if !self.tracker.settle(&id) {
                    self.log(TransferEvent::StaleAck { id });
                }
            }
            ChannelMessage::Abort { reason } => return Err(AbortCause::PeerAborted { reason }),
            other => {
                debug!(session = self.session, kind = other.kind(), "ignoring message while streaming");
            }
        }
        Ok(())
    }

    fn complete(&mut self, flight: InFlight, outcome: AckOutcome) -> Result<(), AbortCause> {
        match outcome {
            AckOutcome::Acked { rtt } => {
                self.outstanding -= 1;
                self.progress.record_chunk(flight.chunk.len());
                self.log(TransferEvent::ChunkAcked {
                    seq: flight.seq,
                    rtt_ms: rtt.as_millis() as u64,
                });
                self.pump()
            }
            AckOutcome::TimedOut(source) => {
                self.log(TransferEvent::AckTimedOut {
                    seq: flight.seq,
                    id: flight.id.clone(),
                    attempt: flight.attempt,
                });
                if flight.attempt > self.config.ack_retries {
                    return Err(AbortCause::AckRetriesExhausted {
                        seq: flight.seq,
                        attempts: flight.attempt,
                        source,
                    });
                }
                warn!(
                    session = self.session,
                    seq = flight.seq,
                    id = %flight.id,
                    attempt = flight.attempt,
                    "ack timed out, re-sending chunk"
                );
                self.progress.record_retry();
                self.send(flight.seq, flight.chunk, flight.attempt + 1)
            }
            // Only produced by teardown, which discards the transport state anyway.
            AckOutcome::Cancelled => Ok(()),
        }
    }

    /// Move held chunks into free window slots.
    fn pump(&mut self) -> Result<(), AbortCause> {
        while self.outstanding < self.config.window_limit {
            let Some((seq, chunk)) = self.pending.pop_front() else {
                break;
            };
            self.outstanding += 1;
            self.send(seq, chunk, 1)?;
        }
        Ok(())
    }

    fn send(&mut self, seq: u64, chunk: Bytes, attempt: u32) -> Result<(), AbortCause> {
        let id = ChunkId::generate();
        let waiter = self.tracker.track(id.clone())?;
        self.outbound.post(&ChannelMessage::StreamChunk {
            id: id.clone(),
            chunk: codec::encode(&chunk),
            seq: Some(seq),
        })?;

        self.log(TransferEvent::ChunkSent {
            seq,
            id: id.clone(),
            size: chunk.len(),
            attempt,
        });

        let flight = InFlight {
            seq,
            id,
            attempt,
            chunk,
        };
        self.in_flight.push(
            async move {
                let outcome = waiter.await;
                (flight, outcome)
            }
            .boxed(),
        );
        Ok(())
    }

    fn teardown(&mut self) {
        let cancelled = self.tracker.cancel_all();
        self.in_flight.clear();
        self.pending.clear();
        self.outstanding = 0;
        if cancelled > 0 {
            debug!(session = self.session, cancelled, "cancelled pending acks");
        }
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

/// Stops the source task when the transport is done with it.
struct ReaderTask(JoinHandle<()>);

impl Drop for ReaderTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn read_source<S: ChunkSource>(mut source: S, tx: mpsc::Sender<io::Result<Bytes>>) {
    loop {
        match source.next_chunk().await {
            Ok(Some(chunk)) => {
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::message_channel;
    use crate::io::MemorySource;
    use std::time::Duration;

    fn transport(window: usize) -> (SenderTransport, crate::channel::Port) {
        let (ours, theirs) = message_channel();
        let config = TransferConfig::default().with_window(window);
        (SenderTransport::new(Arc::new(ours.sender), config), theirs)
    }

    fn chunk_ids(port: &mut crate::channel::Port) -> Vec<ChunkId> {
        let mut ids = Vec::new();
        while let Some(message) = port.inbox.try_recv() {
            if let ChannelMessage::StreamChunk { id, .. } = message {
                ids.push(id);
            }
        }
        ids
    }

    #[tokio::test]
    async fn submit_sends_until_window_is_full() {
        let (mut sender, mut peer) = transport(4);
        for _ in 0..4 {
            assert_eq!(sender.submit(Bytes::from_static(b"x")).unwrap(), Submit::Sent);
        }
        assert_eq!(sender.submit(Bytes::from_static(b"y")).unwrap(), Submit::Suspended);
        assert_eq!(sender.outstanding(), 4);
        assert_eq!(sender.pending(), 1);
        assert_eq!(chunk_ids(&mut peer).len(), 4);
    }

    #[tokio::test]
    async fn finish_waits_for_drain() {
        let (mut sender, _peer) = transport(2);
        sender.submit(Bytes::from_static(b"abc")).unwrap();
        assert_eq!(sender.finish().unwrap(), None);
    }

    #[tokio::test]
    async fn empty_stream_carries_digest_of_nothing() {
        let (mut sender, mut peer) = transport(2);
        let digest = sender.finish().unwrap().unwrap();
        assert_eq!(
            digest,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            peer.inbox.try_recv(),
            Some(ChannelMessage::StreamEnd {
                digest: Some(digest)
            })
        );
        // Only once.
        assert_eq!(sender.finish().unwrap(), None);
    }

    #[tokio::test]
    async fn acks_refill_the_window_in_order() {
        let (ours, mut peer) = message_channel();
        let (ours_tx, mut ours_rx) = ours.split();
        let config = TransferConfig::default().with_window(2);
        let mut sender = SenderTransport::new(Arc::new(ours_tx), config);
        let mut session = Session::new();
        session.transition(SessionState::Starting).unwrap();

        let acker = tokio::spawn(async move {
            let mut payloads = Vec::new();
            while let Some(message) = peer.inbox.recv().await {
                match message {
                    ChannelMessage::StreamChunk { id, chunk, .. } => {
                        payloads.push(codec::decode(&chunk).unwrap());
                        peer.sender.post(&ChannelMessage::ChunkAck { id }).unwrap();
                    }
                    ChannelMessage::StreamEnd { .. } => break,
                    _ => {}
                }
            }
            payloads
        });

        let source = MemorySource::new([&b"one"[..], &b"two"[..], &b"three"[..], &b"four"[..]]);
        sender.run(source, &mut ours_rx, &mut session).await.unwrap();

        let payloads = acker.await.unwrap();
        assert_eq!(payloads, vec!["one", "two", "three", "four"]);
        assert_eq!(session.state(), SessionState::Draining);
        assert_eq!(session.progress().stats().bytes_transferred, 15);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_chunk_is_resent_under_fresh_id() {
        let (ours, mut peer) = message_channel();
        let (ours_tx, mut ours_rx) = ours.split();
        let config = TransferConfig::default()
            .with_window(1)
            .with_ack_timeout(Duration::from_secs(1));
        let mut sender = SenderTransport::new(Arc::new(ours_tx), config);
        let mut session = Session::new();
        session.transition(SessionState::Starting).unwrap();

        // Ignore the first attempt, ack the re-send.
        let acker = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(message) = peer.inbox.recv().await {
                match message {
                    ChannelMessage::StreamChunk { id, seq, .. } => {
                        seen.push((id.clone(), seq));
                        if seen.len() == 2 {
                            peer.sender.post(&ChannelMessage::ChunkAck { id }).unwrap();
                        }
                    }
                    ChannelMessage::StreamEnd { .. } => break,
                    _ => {}
                }
            }
            seen
        });

        sender
            .run(MemorySource::new([&b"slow"[..]]), &mut ours_rx, &mut session)
            .await
            .unwrap();

        let seen = acker.await.unwrap();
        assert_eq!(seen.len(), 2);
        assert_ne!(seen[0].0, seen[1].0);
        // Same logical chunk, so the peer can recognise the copy.
        assert_eq!(seen[0].1, Some(0));
        assert_eq!(seen[1].1, Some(0));
        assert_eq!(session.progress().stats().retries, 1);
    }

    /// Passes everything through except `stream-end`.
    struct NoEnd(crate::channel::PortSender);

    impl Outbound for NoEnd {
        fn post(&self, message: &ChannelMessage) -> Result<(), ChannelSendError> {
            if matches!(message, ChannelMessage::StreamEnd { .. }) {
                return Err(ChannelSendError::Closed);
            }
            self.0.post(message)
        }
    }

    #[tokio::test]
    async fn draining_waits_for_stream_end_to_be_posted() {
        let (ours, mut peer) = message_channel();
        let (ours_tx, mut ours_rx) = ours.split();
        let mut sender = SenderTransport::new(Arc::new(NoEnd(ours_tx)), TransferConfig::default());
        let mut session = Session::new();
        session.transition(SessionState::Starting).unwrap();

        let acker = tokio::spawn(async move {
            while let Some(message) = peer.inbox.recv().await {
                if let ChannelMessage::StreamChunk { id, .. } = message {
                    peer.sender.post(&ChannelMessage::ChunkAck { id }).unwrap();
                }
            }
        });

        let err = sender
            .run(MemorySource::new([&b"only"[..]]), &mut ours_rx, &mut session)
            .await
            .unwrap_err();
        assert!(matches!(err, AbortCause::ChannelSend(ChannelSendError::Closed)));
        assert_eq!(session.state(), SessionState::Transferring);
        acker.abort();
    }
}
