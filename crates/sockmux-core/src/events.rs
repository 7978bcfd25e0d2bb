//! Session event channel
//!
//! The engine publishes lifecycle notifications here and never waits for the
//! consumers. Two subscription styles share one publisher:
//!
//! - per-stream callbacks (`on_connected`, `on_received`, ...), each run by its
//!   own dispatcher task so a slow or panicking handler cannot stall I/O;
//! - [`EventChannel::subscribe`], a bounded receiver of every event for use in
//!   `tokio::select!` loops.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::{Endpoint, OperationKind};

// ----------------------------------------------------------------------------
// Event Types
// ----------------------------------------------------------------------------

/// Notification about one remote endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionEvent {
    pub endpoint: Endpoint,
}

/// Bytes delivered by a single read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveEvent {
    pub endpoint: Endpoint,
    /// Owned copy of exactly the bytes of one read
    pub bytes: Vec<u8>,
}

/// A tracked operation passed its deadline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutEvent {
    pub endpoint: Endpoint,
    pub operation: OperationKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Connected,
    Accepted,
    Sent,
    Received,
    Disconnected,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    Connected(ActionEvent),
    Accepted(ActionEvent),
    Sent(ActionEvent),
    Received(ReceiveEvent),
    Disconnected(ActionEvent),
    TimedOut(TimeoutEvent),
}

impl SessionEvent {
    pub fn connected(endpoint: Endpoint) -> Self {
        SessionEvent::Connected(ActionEvent { endpoint })
    }

    pub fn accepted(endpoint: Endpoint) -> Self {
        SessionEvent::Accepted(ActionEvent { endpoint })
    }

    pub fn sent(endpoint: Endpoint) -> Self {
        SessionEvent::Sent(ActionEvent { endpoint })
    }

    pub fn received(endpoint: Endpoint, bytes: Vec<u8>) -> Self {
        SessionEvent::Received(ReceiveEvent { endpoint, bytes })
    }

    pub fn disconnected(endpoint: Endpoint) -> Self {
        SessionEvent::Disconnected(ActionEvent { endpoint })
    }

    pub fn timed_out(endpoint: Endpoint, operation: OperationKind) -> Self {
        SessionEvent::TimedOut(TimeoutEvent {
            endpoint,
            operation,
        })
    }

    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::Connected(_) => EventKind::Connected,
            SessionEvent::Accepted(_) => EventKind::Accepted,
            SessionEvent::Sent(_) => EventKind::Sent,
            SessionEvent::Received(_) => EventKind::Received,
            SessionEvent::Disconnected(_) => EventKind::Disconnected,
            SessionEvent::TimedOut(_) => EventKind::TimedOut,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        match self {
            SessionEvent::Connected(e)
            | SessionEvent::Accepted(e)
            | SessionEvent::Sent(e)
            | SessionEvent::Disconnected(e) => e.endpoint,
            SessionEvent::Received(e) => e.endpoint,
            SessionEvent::TimedOut(e) => e.endpoint,
        }
    }
}

pub type EventReceiver = mpsc::Receiver<SessionEvent>;

// ----------------------------------------------------------------------------
// Event Channel
// ----------------------------------------------------------------------------

type Handler = Box<dyn Fn(&SessionEvent) + Send + Sync + 'static>;

struct Subscription {
    kind: EventKind,
    dispatcher: mpsc::UnboundedSender<SessionEvent>,
}

struct Inner {
    subscriptions: Mutex<Vec<Subscription>>,
    receivers: Mutex<Vec<mpsc::Sender<SessionEvent>>>,
    buffer_size: usize,
    sealed: AtomicBool,
}

/// Publisher side of the five session notification streams (plus time-outs)
///
/// Cloning yields another handle to the same channel. Callback registration
/// spawns a dispatcher task, so the `on_*` methods panic outside a Tokio
/// runtime just like `tokio::spawn`.
#[derive(Clone)]
pub struct EventChannel {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Handlers never run under these locks, so a poisoned lock still holds
    // consistent data.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl EventChannel {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscriptions: Mutex::new(Vec::new()),
                receivers: Mutex::new(Vec::new()),
                buffer_size: buffer_size.max(1),
                sealed: AtomicBool::new(false),
            }),
        }
    }

    /// Receive every event published from now on
    ///
    /// When the receiver falls `buffer_size` events behind, further events are
    /// dropped for it until it catches up.
    pub fn subscribe(&self) -> EventReceiver {
        let (tx, rx) = mpsc::channel(self.inner.buffer_size);
        // Checked under the lock so a concurrent seal cannot miss this sender.
        let mut receivers = lock(&self.inner.receivers);
        if !self.is_sealed() {
            receivers.push(tx);
        }
        rx
    }

    pub fn on_connected<F>(&self, handler: F)
    where
        F: Fn(&ActionEvent) + Send + Sync + 'static,
    {
        self.register(EventKind::Connected, move |event| {
            if let SessionEvent::Connected(e) = event {
                handler(e)
            }
        });
    }

    pub fn on_accepted<F>(&self, handler: F)
    where
        F: Fn(&ActionEvent) + Send + Sync + 'static,
    {
        self.register(EventKind::Accepted, move |event| {
            if let SessionEvent::Accepted(e) = event {
                handler(e)
            }
        });
    }

    pub fn on_sent<F>(&self, handler: F)
    where
        F: Fn(&ActionEvent) + Send + Sync + 'static,
    {
        self.register(EventKind::Sent, move |event| {
            if let SessionEvent::Sent(e) = event {
                handler(e)
            }
        });
    }

    pub fn on_received<F>(&self, handler: F)
    where
        F: Fn(&ReceiveEvent) + Send + Sync + 'static,
    {
        self.register(EventKind::Received, move |event| {
            if let SessionEvent::Received(e) = event {
                handler(e)
            }
        });
    }

    pub fn on_disconnected<F>(&self, handler: F)
    where
        F: Fn(&ActionEvent) + Send + Sync + 'static,
    {
        self.register(EventKind::Disconnected, move |event| {
            if let SessionEvent::Disconnected(e) = event {
                handler(e)
            }
        });
    }

    pub fn on_timed_out<F>(&self, handler: F)
    where
        F: Fn(&TimeoutEvent) + Send + Sync + 'static,
    {
        self.register(EventKind::TimedOut, move |event| {
            if let SessionEvent::TimedOut(e) = event {
                handler(e)
            }
        });
    }

    fn register<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        if self.is_sealed() {
            debug!("Ignoring {:?} handler registered on a closed session", kind);
            return;
        }

        let handler: Handler = Box::new(handler);
        let (dispatcher, mut queue) = mpsc::unbounded_channel::<SessionEvent>();

        tokio::spawn(async move {
            while let Some(event) = queue.recv().await {
                if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                    warn!(
                        "{:?} handler panicked while handling event for {}",
                        kind,
                        event.endpoint()
                    );
                }
            }
        });

        let mut subscriptions = lock(&self.inner.subscriptions);
        if !self.is_sealed() {
            subscriptions.push(Subscription { kind, dispatcher });
        }
    }

    /// Hand an event to every interested subscriber without waiting
    pub fn publish(&self, event: SessionEvent) {
        if self.is_sealed() {
            debug!("Dropping {:?} event published after close", event.kind());
            return;
        }

        let kind = event.kind();
        let mut subscriptions = lock(&self.inner.subscriptions);
        if self.is_sealed() {
            return;
        }
        subscriptions.retain(|sub| {
            if sub.kind != kind {
                return true;
            }
            sub.dispatcher.send(event.clone()).is_ok()
        });
        drop(subscriptions);

        lock(&self.inner.receivers).retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Event subscriber is full, dropping {:?} event for {}",
                    kind,
                    event.endpoint()
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Stop publishing; queued events are still delivered
    pub fn seal(&self) {
        if self.inner.sealed.swap(true, Ordering::SeqCst) {
            return;
        }
        lock(&self.inner.subscriptions).clear();
        lock(&self.inner.receivers).clear();
    }

    pub fn is_sealed(&self) -> bool {
        self.inner.sealed.load(Ordering::SeqCst)
    }

    /// Number of live callback registrations and receivers
    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.subscriptions).len() + lock(&self.inner.receivers).len()
    }
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannel")
            .field("subscribers", &self.subscriber_count())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}
