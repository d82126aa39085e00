/// Session lifecycle state machine and the progress counters observers read.
///
/// ```text
/// Idle -> Starting -> Transferring -> Draining -> Completed
///            \______________________________/--> Completed (zero chunks)
/// any non-terminal state ------------------------> Failed
/// Completed | Failed --reset()--> Idle
/// ```

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use conduit_types::{SessionState, TransferStats};
use tokio::time::Instant;
use tracing::debug;

use crate::error::InvalidTransition;
use crate::logging::{TransferEvent, TransferLog, TransferLogger};

fn allowed(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;
    match (from, to) {
        (Idle, Starting)
        | (Starting, Transferring)
        | (Starting, Completed)
        | (Transferring, Draining)
        | (Draining, Completed) => true,
        (from, Failed) => !from.is_terminal(),
        _ => false,
    }
}

/// Counters shared between the task running a transfer and anyone watching it.
pub struct SessionProgress {
    state: AtomicU8,
    bytes: AtomicU64,
    chunks: AtomicU64,
    retries: AtomicU64,
    peak_queue: AtomicU64,
    /// 0 = not checked, 1 = matched, 2 = mismatched
    digest: AtomicU8,
    started_at: Mutex<Option<Instant>>,
    finished_at: Mutex<Option<Instant>>,
}

impl SessionProgress {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(SessionState::Idle.as_u8()),
            bytes: AtomicU64::new(0),
            chunks: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            peak_queue: AtomicU64::new(0),
            digest: AtomicU8::new(0),
            started_at: Mutex::new(None),
            finished_at: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire)).unwrap_or(SessionState::Idle)
    }

    pub fn record_chunk(&self, bytes: usize) {
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.chunks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn observe_queue(&self, len: usize) {
        self.peak_queue.fetch_max(len as u64, Ordering::Relaxed);
    }

    pub fn record_digest(&self, matched: Option<bool>) {
        let value = match matched {
            None => 0,
            Some(true) => 1,
            Some(false) => 2,
        };
        self.digest.store(value, Ordering::Relaxed);
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Snapshot of the counters. `elapsed` runs from the start signal until the
    /// session reached a terminal state (or until now while it is running).
    pub fn stats(&self) -> TransferStats {
        let started = *self.started_at.lock().unwrap_or_else(PoisonError::into_inner);
        let finished = *self.finished_at.lock().unwrap_or_else(PoisonError::into_inner);
        let elapsed = match started {
            Some(start) => finished.unwrap_or_else(Instant::now).saturating_duration_since(start),
            None => Default::default(),
        };
        let digest_verified = match self.digest.load(Ordering::Relaxed) {
            1 => Some(true),
            2 => Some(false),
            _ => None,
        };
        TransferStats {
            bytes_transferred: self.bytes.load(Ordering::Relaxed),
            chunks: self.chunks.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            peak_queue: self.peak_queue.load(Ordering::Relaxed),
            digest_verified,
            elapsed,
        }
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state.as_u8(), Ordering::Release);
        let now = Instant::now();
        if state == SessionState::Starting {
            *self.started_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(now);
        }
        if state.is_terminal() {
            *self.finished_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(now);
        }
    }

    fn clear(&self) {
        self.state.store(SessionState::Idle.as_u8(), Ordering::Release);
        self.bytes.store(0, Ordering::Relaxed);
        self.chunks.store(0, Ordering::Relaxed);
        self.retries.store(0, Ordering::Relaxed);
        self.peak_queue.store(0, Ordering::Relaxed);
        self.digest.store(0, Ordering::Relaxed);
        *self.started_at.lock().unwrap_or_else(PoisonError::into_inner) = None;
        *self.finished_at.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl Default for SessionProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// One endpoint's view of the current session.
pub struct Session {
    state: SessionState,
    history: Vec<SessionState>,
    generation: u32,
    progress: Arc<SessionProgress>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            history: vec![SessionState::Idle],
            generation: 1,
            progress: Arc::new(SessionProgress::new()),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Every state this session has been in, oldest first.
    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    /// Incremented on every reset; identifies the transfer in logs.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn progress(&self) -> Arc<SessionProgress> {
        Arc::clone(&self.progress)
    }

    /// Move to `to`, returning the previous state.
    pub fn transition(&mut self, to: SessionState) -> Result<SessionState, InvalidTransition> {
        let from = self.state;
        if !allowed(from, to) {
            return Err(InvalidTransition { from, to });
        }
        self.state = to;
        self.history.push(to);
        self.progress.set_state(to);
        Ok(from)
    }

    /// [`transition`](Self::transition), reported to tracing and the transfer logger.
    pub fn advance(
        &mut self,
        to: SessionState,
        component: &'static str,
        logger: Option<&Arc<dyn TransferLogger>>,
    ) -> Result<(), InvalidTransition> {
        let from = self.transition(to)?;
        debug!(component, session = self.generation, %from, %to, "session state changed");
        if let Some(logger) = logger {
            logger.log(TransferLog {
                component,
                session: self.generation,
                event: TransferEvent::StateChanged { from, to },
            });
        }
        Ok(())
    }

    /// Move to `Failed` unless already terminal. Returns the previous state
    /// when a transition happened.
    pub fn fail(&mut self) -> Option<SessionState> {
        self.transition(SessionState::Failed).ok()
    }

    /// Back to `Idle` for a new transfer. Only valid once the current session
    /// is terminal (or never started).
    pub fn reset(&mut self) -> Result<(), InvalidTransition> {
        if !(self.state.is_terminal() || self.state == SessionState::Idle) {
            return Err(InvalidTransition {
                from: self.state,
                to: SessionState::Idle,
            });
        }
        self.state = SessionState::Idle;
        self.history.clear();
        self.history.push(SessionState::Idle);
        self.generation += 1;
        self.progress.clear();
        Ok(())
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    #[test]
    fn full_lifecycle() {
        let mut session = Session::new();
        for to in [Starting, Transferring, Draining, Completed] {
            session.transition(to).unwrap();
        }
        assert_eq!(
            session.history(),
            &[Idle, Starting, Transferring, Draining, Completed]
        );
        assert_eq!(session.progress().state(), Completed);
    }

    #[test]
    fn empty_transfer_skips_to_completed() {
        let mut session = Session::new();
        session.transition(Starting).unwrap();
        assert_eq!(session.transition(Completed), Ok(Starting));
    }

    #[test]
    fn skipping_states_is_rejected() {
        let mut session = Session::new();
        let err = session.transition(Transferring).unwrap_err();
        assert_eq!(err, InvalidTransition { from: Idle, to: Transferring });
        assert_eq!(session.state(), Idle);
    }

    #[test]
    fn failed_is_reachable_from_non_terminal_states_only() {
        let mut session = Session::new();
        session.transition(Starting).unwrap();
        assert_eq!(session.fail(), Some(Starting));
        assert_eq!(session.fail(), None);
        assert!(session.transition(Completed).is_err());
    }

    #[test]
    fn reset_requires_terminal_state() {
        let mut session = Session::new();
        session.transition(Starting).unwrap();
        assert!(session.reset().is_err());

        session.transition(Completed).unwrap();
        session.progress().record_chunk(10);
        session.reset().unwrap();
        assert_eq!(session.state(), Idle);
        assert_eq!(session.generation(), 2);
        assert_eq!(session.history(), &[Idle]);
        assert_eq!(session.progress().stats(), TransferStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_stops_at_terminal_state() {
        let mut session = Session::new();
        let progress = session.progress();
        session.transition(Starting).unwrap();
        tokio::time::advance(std::time::Duration::from_secs(3)).await;
        session.transition(Completed).unwrap();
        tokio::time::advance(std::time::Duration::from_secs(5)).await;
        assert_eq!(progress.stats().elapsed, std::time::Duration::from_secs(3));
    }

    #[test]
    fn progress_tracks_peak_queue_and_digest() {
        let progress = SessionProgress::new();
        progress.observe_queue(3);
        progress.observe_queue(1);
        progress.record_chunk(1024);
        progress.record_chunk(1024);
        progress.record_digest(Some(true));

        let stats = progress.stats();
        assert_eq!(stats.peak_queue, 3);
        assert_eq!(stats.bytes_transferred, 2048);
        assert_eq!(stats.chunks, 2);
        assert_eq!(stats.digest_verified, Some(true));
    }
}
