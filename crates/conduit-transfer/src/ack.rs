/// Acknowledgment tracking for in-flight chunks.
///
/// Every sent chunk gets a `PendingAck` keyed by its id. The entry is removed
/// exactly once: by a matching `chunk-ack`, by deadline expiry, or by
/// cancellation when the session fails. Removal happens before the waiter is
/// resolved, so a late or duplicate ack finds nothing and is ignored.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use conduit_types::ChunkId;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{AckTimeoutError, DuplicateAckId};

/// Default time a chunk may stay unacknowledged.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// How a tracked chunk was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    Acked { rtt: Duration },
    TimedOut(AckTimeoutError),
    /// The tracker gave up on the chunk (session failure or teardown).
    Cancelled,
}

struct PendingAck {
    created_at: Instant,
    deadline: Instant,
    resolver: oneshot::Sender<AckOutcome>,
}

pub struct AckTracker {
    pending: HashMap<ChunkId, PendingAck>,
    timeout: Duration,
}

impl AckTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Track `id` with the default deadline (now + timeout).
    pub fn track(&mut self, id: ChunkId) -> Result<AckWaiter, DuplicateAckId> {
        let deadline = Instant::now() + self.timeout;
        self.track_until(id, deadline)
    }

    /// Track `id` until an explicit deadline.
    pub fn track_until(
        &mut self,
        id: ChunkId,
        deadline: Instant,
    ) -> Result<AckWaiter, DuplicateAckId> {
        if self.pending.contains_key(&id) {
            return Err(DuplicateAckId(id));
        }
        let (resolver, rx) = oneshot::channel();
        self.pending.insert(
            id.clone(),
            PendingAck {
                created_at: Instant::now(),
                deadline,
                resolver,
            },
        );
        Ok(AckWaiter { id, rx })
    }

    /// Resolve the pending ack for `id`.
    ///
    /// Returns `false` for an unknown id (arrived after its timeout, or a
    /// duplicate); that is not an error.
    pub fn settle(&mut self, id: &ChunkId) -> bool {
        let Some(pending) = self.pending.remove(id) else {
            return false;
        };
        let rtt = pending.created_at.elapsed();
        // The waiter may already be gone if the sender was torn down.
        let _ = pending.resolver.send(AckOutcome::Acked { rtt });
        true
    }

    /// Reject every pending ack whose deadline is at or before `now`.
    /// Returns the ids that timed out.
    pub fn expire(&mut self, now: Instant) -> Vec<ChunkId> {
        let overdue: Vec<ChunkId> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &overdue {
            if let Some(pending) = self.pending.remove(id) {
                let _ = pending
                    .resolver
                    .send(AckOutcome::TimedOut(AckTimeoutError { id: id.clone() }));
            }
        }
        overdue
    }

    /// Earliest deadline among pending acks.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|pending| pending.deadline).min()
    }

    /// Reject everything still pending. Returns how many were cancelled.
    pub fn cancel_all(&mut self) -> usize {
        let count = self.pending.len();
        for (_, pending) in self.pending.drain() {
            let _ = pending.resolver.send(AckOutcome::Cancelled);
        }
        count
    }

    pub fn is_pending(&self, id: &ChunkId) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for AckTracker {
    fn default() -> Self {
        Self::new(DEFAULT_ACK_TIMEOUT)
    }
}

/// Future resolving once the tracked chunk is acked, timed out or cancelled.
pub struct AckWaiter {
    id: ChunkId,
    rx: oneshot::Receiver<AckOutcome>,
}

impl AckWaiter {
    pub fn id(&self) -> &ChunkId {
        &self.id
    }
}

impl Future for AckWaiter {
    type Output = AckOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(AckOutcome::Cancelled))
    }
}
