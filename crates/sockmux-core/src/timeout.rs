//! Time-out scheduling for in-flight operations
//!
//! Each tracked operation gets a timer task and an entry in a pending map.
//! Completion and expiry race to remove that entry; whichever removes it
//! decides the outcome, so an operation either completes or times out, never
//! both.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::errors::{SockmuxError, SockmuxResult, TimeoutError};
use crate::events::{EventChannel, SessionEvent};
use crate::types::{Endpoint, OperationId, OperationKind};

struct PendingOperation {
    endpoint: Endpoint,
    operation: OperationKind,
    expired: oneshot::Sender<TimeoutError>,
    timer: Option<AbortHandle>,
}

/// Claim on one scheduled deadline
///
/// Resolve it with [`TimeoutScheduler::cancel`] when the operation completes,
/// or await [`TimeoutHandle::expired`] to learn that it timed out.
#[derive(Debug)]
pub struct TimeoutHandle {
    id: OperationId,
    endpoint: Endpoint,
    operation: OperationKind,
    expired: oneshot::Receiver<TimeoutError>,
}

impl TimeoutHandle {
    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn operation(&self) -> OperationKind {
        self.operation
    }

    /// Wait for the deadline; `None` if the operation was cancelled instead
    pub async fn expired(&mut self) -> Option<TimeoutError> {
        (&mut self.expired).await.ok()
    }
}

/// Fires a time-out event when an operation outlives its deadline
#[derive(Clone)]
pub struct TimeoutScheduler {
    pending: Arc<DashMap<OperationId, PendingOperation>>,
    events: EventChannel,
}

impl TimeoutScheduler {
    pub fn new(events: EventChannel) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            events,
        }
    }

    /// Start the clock for an operation
    ///
    /// When `after` elapses before [`cancel`](Self::cancel), a `TimedOut`
    /// event is published and the handle's `expired` future resolves.
    pub fn schedule(
        &self,
        endpoint: Endpoint,
        operation: OperationKind,
        after: Duration,
    ) -> TimeoutHandle {
        let id = OperationId::new();
        let (tx, rx) = oneshot::channel();

        self.pending.insert(
            id,
            PendingOperation {
                endpoint,
                operation,
                expired: tx,
                timer: None,
            },
        );

        let pending = self.pending.clone();
        let events = self.events.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some((_, op)) = pending.remove(&id) {
                warn!("{} to {} timed out after {:?}", op.operation, op.endpoint, after);
                events.publish(SessionEvent::timed_out(op.endpoint, op.operation));
                let _ = op.expired.send(TimeoutError {
                    endpoint: op.endpoint,
                    operation: op.operation,
                    after,
                });
            }
        });

        // Absent when the deadline already fired.
        if let Some(mut entry) = self.pending.get_mut(&id) {
            entry.timer = Some(timer.abort_handle());
        }

        TimeoutHandle {
            id,
            endpoint,
            operation,
            expired: rx,
        }
    }

    /// Mark the operation complete; returns false if it had already timed out
    pub fn cancel(&self, handle: TimeoutHandle) -> bool {
        self.cancel_id(handle.id)
    }

    fn cancel_id(&self, id: OperationId) -> bool {
        match self.pending.remove(&id) {
            Some((_, op)) => {
                if let Some(timer) = op.timer {
                    timer.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Run `operation` against a deadline
    ///
    /// On expiry the operation future is dropped, which abandons it, and the
    /// time-out is returned. If the deadline is dropped by
    /// [`cancel_all`](Self::cancel_all) the operation fails with `Disposed`.
    pub async fn track<F, T>(
        &self,
        endpoint: Endpoint,
        operation: OperationKind,
        after: Duration,
        work: F,
    ) -> SockmuxResult<T>
    where
        F: Future<Output = SockmuxResult<T>>,
    {
        let TimeoutHandle { id, expired, .. } = self.schedule(endpoint, operation, after);
        tokio::pin!(work);

        tokio::select! {
            biased;
            result = &mut work => {
                if self.cancel_id(id) {
                    result
                } else {
                    // The timer won the race and has already reported.
                    Err(TimeoutError { endpoint, operation, after }.into())
                }
            }
            outcome = expired => match outcome {
                Ok(timeout) => Err(timeout.into()),
                Err(_) => Err(SockmuxError::Disposed),
            },
        }
    }

    /// Drop every pending deadline without firing it
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<OperationId> = self.pending.iter().map(|e| *e.key()).collect();
        let cancelled = ids.into_iter().filter(|id| self.cancel_id(*id)).count();
        if cancelled > 0 {
            debug!("Cancelled {} pending deadlines", cancelled);
        }
        cancelled
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl std::fmt::Debug for TimeoutScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutScheduler")
            .field("pending", &self.pending())
            .finish()
    }
}
