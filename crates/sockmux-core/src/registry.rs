//! Endpoint registry
//!
//! Maps each remote endpoint to the live connection serving it. The map is
//! shared by the accept loop (insert), read loops (remove on disconnect), the
//! send path (lookup) and session close (drain), so it is backed by a
//! [`DashMap`] and every operation is atomic with respect to the others.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{watch, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use crate::types::Endpoint;

// ----------------------------------------------------------------------------
// Peer Handle Trait
// ----------------------------------------------------------------------------

/// Anything the registry can hold and tear down
pub trait PeerHandle: Clone + Send + Sync + 'static {
    /// Release the connection's resources; must be idempotent
    fn close(&self);
}

// ----------------------------------------------------------------------------
// Remote Connection
// ----------------------------------------------------------------------------

struct ConnectionInner {
    endpoint: Endpoint,
    writer: Mutex<Option<OwnedWriteHalf>>,
    reader: StdMutex<Option<AbortHandle>>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    bytes_sent: AtomicU64,
}

/// One live TCP connection: its write half and the task reading from it
///
/// Clones share the same socket. Closing aborts the read loop, interrupts a
/// send that is in flight and drops the write half.
#[derive(Clone)]
pub struct RemoteConnection {
    inner: Arc<ConnectionInner>,
}

impl RemoteConnection {
    pub fn new(endpoint: Endpoint, writer: OwnedWriteHalf) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                endpoint,
                writer: Mutex::new(Some(writer)),
                reader: StdMutex::new(None),
                closed: AtomicBool::new(false),
                shutdown: watch::Sender::new(false),
                bytes_sent: AtomicU64::new(0),
            }),
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.inner.endpoint
    }

    /// Tie the read loop's lifetime to this connection
    pub fn attach_reader(&self, reader: AbortHandle) {
        let mut slot = self
            .inner
            .reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.is_closed() {
            reader.abort();
            return;
        }
        if let Some(previous) = slot.replace(reader) {
            previous.abort();
        }
    }

    /// Write the whole payload, serialized against other sends to this peer
    pub async fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut writer = self.inner.writer.lock().await;
        let stream = match writer.as_mut() {
            Some(stream) if !self.is_closed() => stream,
            _ => return Err(io::Error::new(io::ErrorKind::NotConnected, "connection closed")),
        };

        let result = tokio::select! {
            written = async {
                match stream.write_all(bytes).await {
                    Ok(()) => stream.flush().await,
                    Err(e) => Err(e),
                }
            } => written,
            _ = shutdown.wait_for(|closed| *closed) => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection closed during send",
            )),
        };

        if result.is_ok() {
            self.inner
                .bytes_sent
                .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        }
        // close() could not take the writer while this send held it.
        if self.is_closed() {
            writer.take();
        }
        result
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.inner.bytes_sent.load(Ordering::Relaxed)
    }
}

impl PeerHandle for RemoteConnection {
    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        trace!("Closing connection to {}", self.inner.endpoint);
        self.inner.shutdown.send_replace(true);

        let reader = self
            .inner
            .reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(reader) = reader {
            reader.abort();
        }
        if let Ok(mut writer) = self.inner.writer.try_lock() {
            writer.take();
        }
    }
}

impl std::fmt::Debug for RemoteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConnection")
            .field("endpoint", &self.inner.endpoint)
            .field("closed", &self.is_closed())
            .field("bytes_sent", &self.bytes_sent())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Endpoint Registry
// ----------------------------------------------------------------------------

/// Concurrent map of live remote connections keyed by endpoint
///
/// An endpoint appears at most once. Every entry removed from the registry is
/// closed, whichever path removed it.
pub struct EndpointRegistry<C: PeerHandle = RemoteConnection> {
    connections: DashMap<Endpoint, C>,
}

impl<C: PeerHandle> EndpointRegistry<C> {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Register a connection; returns false and closes it when the endpoint
    /// is already present
    pub fn add(&self, endpoint: Endpoint, connection: C) -> bool {
        match self.connections.entry(endpoint) {
            Entry::Occupied(_) => {
                debug!("Endpoint {} already registered, rejecting duplicate", endpoint);
                connection.close();
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(connection);
                true
            }
        }
    }

    /// Remove and close the connection for an endpoint
    ///
    /// Returns true only for the caller that actually removed the entry, so
    /// racing removers can use it to decide who reports the disconnection.
    pub fn remove(&self, endpoint: &Endpoint) -> bool {
        match self.connections.remove(endpoint) {
            Some((_, connection)) => {
                connection.close();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, endpoint: &Endpoint) -> Option<C> {
        self.connections.get(endpoint).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.connections.contains_key(endpoint)
    }

    /// Sorted snapshot of registered endpoints
    pub fn list(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<Endpoint> = self.connections.iter().map(|e| *e.key()).collect();
        endpoints.sort();
        endpoints
    }

    /// Snapshot of every registered connection
    pub fn all(&self) -> Vec<(Endpoint, C)> {
        self.connections
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Remove and close every connection, returning the endpoints this call
    /// removed
    pub fn clear(&self) -> Vec<Endpoint> {
        let mut removed = Vec::new();
        for endpoint in self.list() {
            if self.remove(&endpoint) {
                removed.push(endpoint);
            }
        }
        removed
    }
}

impl<C: PeerHandle> Default for EndpointRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: PeerHandle> std::fmt::Debug for EndpointRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointRegistry")
            .field("endpoints", &self.list())
            .finish()
    }
}
