/// Session lifecycle on both ends of the channel.
///
/// The receiving context initiates: [`ReceiverCoordinator::start_transfer`]
/// posts `start-transfer` and runs the receiver until the sink is closed. The
/// sending context responds: [`SenderCoordinator::serve`] waits for the start
/// signal, streams its source and waits for `stream-closed`.

use std::sync::Arc;

use conduit_types::{ChannelMessage, SessionState, TransferStats};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::channel::{Inbox, Outbound, Port};
use crate::config::TransferConfig;
use crate::error::{AbortCause, InvalidTransition, TransferAborted};
use crate::io::{ChunkSink, ChunkSource};
use crate::logging::{TransferEvent, TransferLog, TransferLogger};
use crate::receiver::ReceiverTransport;
use crate::sender::SenderTransport;
use crate::session::{Session, SessionProgress};

/// Shared bookkeeping for a finished or failed session.
struct Lifecycle {
    component: &'static str,
    session: Session,
    outbound: Arc<dyn Outbound>,
    logger: Option<Arc<dyn TransferLogger>>,
}

impl Lifecycle {
    fn advance(&mut self, to: SessionState) -> Result<(), InvalidTransition> {
        self.session.advance(to, self.component, self.logger.as_ref())
    }

    fn complete(&mut self) -> Result<TransferStats, TransferAborted> {
        if let Err(e) = self.advance(SessionState::Completed) {
            return Err(self.fail(e.into()));
        }
        let stats = self.session.progress().stats();
        info!(
            component = self.component,
            session = self.session.generation(),
            bytes = stats.bytes_transferred,
            chunks = stats.chunks,
            retries = stats.retries,
            "transfer complete"
        );
        self.log(TransferEvent::TransferComplete {
            total_bytes: stats.bytes_transferred,
            chunks: stats.chunks,
            duration_ms: stats.elapsed.as_millis() as u64,
            retries: stats.retries,
        });
        Ok(stats)
    }

    /// Move to `Failed`, tell the peer when appropriate and wrap the cause.
    fn fail(&mut self, cause: AbortCause) -> TransferAborted {
        if let Some(from) = self.session.fail() {
            self.log(TransferEvent::StateChanged {
                from,
                to: SessionState::Failed,
            });
        }
        if cause.notify_peer() {
            // Best effort; the channel may be what failed.
            if let Err(e) = self.outbound.post(&ChannelMessage::abort(cause.to_string())) {
                debug!(component = self.component, error = %e, "could not notify peer of abort");
            }
        }
        warn!(
            component = self.component,
            session = self.session.generation(),
            error = %cause,
            "transfer failed"
        );
        self.log(TransferEvent::TransferFailed {
            message: cause.to_string(),
        });
        TransferAborted { cause }
    }

    fn log(&self, event: TransferEvent) {
        if let Some(ref logger) = self.logger {
            logger.log(TransferLog {
                component: self.component,
                session: self.session.generation(),
                event,
            });
        }
    }
}

/// Initiating side: owns the sink and asks the peer for its stream.
pub struct ReceiverCoordinator<S> {
    lifecycle: Lifecycle,
    transport: ReceiverTransport<S>,
    inbox: Inbox,
}

impl<S: ChunkSink> ReceiverCoordinator<S> {
    pub fn new(outbound: Arc<dyn Outbound>, inbox: Inbox, sink: S, config: TransferConfig) -> Self {
        Self {
            transport: ReceiverTransport::new(sink, Arc::clone(&outbound), config),
            lifecycle: Lifecycle {
                component: "receiver",
                session: Session::new(),
                outbound,
                logger: None,
            },
            inbox,
        }
    }

    pub fn from_port(port: Port, sink: S, config: TransferConfig) -> Self {
        let (sender, inbox) = port.split();
        Self::new(Arc::new(sender), inbox, sink, config)
    }

    pub fn with_logger(mut self, logger: Arc<dyn TransferLogger>) -> Self {
        self.transport = self.transport.with_logger(Arc::clone(&logger));
        self.lifecycle.logger = Some(logger);
        self
    }

    /// Ask the peer to stream and receive until the sink is closed.
    ///
    /// Only valid from `Idle`; call [`reset`](Self::reset) between transfers.
    pub async fn start_transfer(&mut self) -> Result<TransferStats, TransferAborted> {
        // Not a session failure: the current session is left as it was.
        self.lifecycle.advance(SessionState::Starting).map_err(AbortCause::from)?;

        if let Err(e) = self.lifecycle.outbound.post(&ChannelMessage::StartTransfer) {
            return Err(self.lifecycle.fail(e.into()));
        }
        match self.transport.run(&mut self.inbox, &mut self.lifecycle.session).await {
            Ok(()) => self.lifecycle.complete(),
            Err(cause) => Err(self.lifecycle.fail(cause)),
        }
    }

    /// Prepare for another transfer over the same channel with a new sink.
    /// Returns the sink of the previous transfer.
    ///
    /// Messages already delivered for the previous session are discarded.
    pub fn reset(&mut self, sink: S) -> Result<S, InvalidTransition> {
        self.lifecycle.session.reset()?;
        let mut discarded = 0usize;
        while let Some(message) = self.inbox.try_recv() {
            debug!(kind = message.kind(), "discarding message of previous session");
            discarded += 1;
        }
        if discarded > 0 {
            info!(discarded, "cleared leftovers before reuse");
        }
        Ok(self.transport.reset(sink))
    }

    pub fn sink(&self) -> &S {
        self.transport.sink()
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.session.state()
    }

    pub fn history(&self) -> &[SessionState] {
        self.lifecycle.session.history()
    }

    pub fn stats(&self) -> TransferStats {
        self.lifecycle.session.progress().stats()
    }

    pub fn progress(&self) -> Arc<SessionProgress> {
        self.lifecycle.session.progress()
    }
}

/// Responding side: streams a source once the peer asks for it.
pub struct SenderCoordinator {
    lifecycle: Lifecycle,
    inbox: Inbox,
    config: TransferConfig,
}

impl SenderCoordinator {
    pub fn new(outbound: Arc<dyn Outbound>, inbox: Inbox, config: TransferConfig) -> Self {
        Self {
            lifecycle: Lifecycle {
                component: "sender",
                session: Session::new(),
                outbound,
                logger: None,
            },
            inbox,
            config,
        }
    }

    pub fn from_port(port: Port, config: TransferConfig) -> Self {
        let (sender, inbox) = port.split();
        Self::new(Arc::new(sender), inbox, config)
    }

    pub fn with_logger(mut self, logger: Arc<dyn TransferLogger>) -> Self {
        self.lifecycle.logger = Some(logger);
        self
    }

    /// Wait for `start-transfer`, stream `source` and wait for the peer to
    /// confirm its sink is closed.
    ///
    /// A session that already ended is reset first, so `serve` can be called
    /// once per transfer on the same channel.
    pub async fn serve<S: ChunkSource>(&mut self, source: S) -> Result<TransferStats, TransferAborted> {
        if self.lifecycle.session.state().is_terminal() {
            self.lifecycle.session.reset().map_err(AbortCause::from)?;
        }

        if let Err(cause) = self.await_start().await {
            return Err(self.lifecycle.fail(cause));
        }
        match self.stream(source).await {
            Ok(()) => self.lifecycle.complete(),
            Err(cause) => Err(self.lifecycle.fail(cause)),
        }
    }

    async fn await_start(&mut self) -> Result<(), AbortCause> {
        loop {
            match self.inbox.recv().await {
                Some(ChannelMessage::StartTransfer) => break,
                Some(ChannelMessage::Abort { reason }) => return Err(AbortCause::PeerAborted { reason }),
                // Leftovers of a previous session, e.g. a late ack.
                Some(other) => debug!(kind = other.kind(), "ignoring message while idle"),
                None => return Err(AbortCause::ChannelClosed),
            }
        }
        self.lifecycle.advance(SessionState::Starting)?;
        self.lifecycle.outbound.post(&ChannelMessage::StreamReady)?;
        Ok(())
    }

    async fn stream<S: ChunkSource>(&mut self, source: S) -> Result<(), AbortCause> {
        let mut transport = SenderTransport::new(Arc::clone(&self.lifecycle.outbound), self.config.clone());
        if let Some(ref logger) = self.lifecycle.logger {
            transport = transport.with_logger(Arc::clone(logger));
        }
        transport
            .run(source, &mut self.inbox, &mut self.lifecycle.session)
            .await?;

        let sent = self.lifecycle.session.progress().bytes_transferred();
        let close_timeout = self.config.close_timeout;
        let bytes = timeout_at(Instant::now() + close_timeout, self.await_closed())
            .await
            .map_err(|_| AbortCause::CloseTimeout(close_timeout))??;
        if bytes != sent {
            warn!(sent, received = bytes, "peer reports a different byte count");
        }
        Ok(())
    }

    async fn await_closed(&mut self) -> Result<u64, AbortCause> {
        loop {
            match self.inbox.recv().await {
                Some(ChannelMessage::StreamClosed { bytes }) => return Ok(bytes),
                Some(ChannelMessage::Abort { reason }) => return Err(AbortCause::PeerAborted { reason }),
                Some(other) => debug!(kind = other.kind(), "ignoring message while closing"),
                None => return Err(AbortCause::ChannelClosed),
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.session.state()
    }

    pub fn history(&self) -> &[SessionState] {
        self.lifecycle.session.history()
    }

    pub fn stats(&self) -> TransferStats {
        self.lifecycle.session.progress().stats()
    }

    pub fn progress(&self) -> Arc<SessionProgress> {
        self.lifecycle.session.progress()
    }
}
