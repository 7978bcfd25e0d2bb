//! The connection engine
//!
//! A [`Session`] owns one local socket and runs in one of two roles:
//!
//! - **Client**: dials a single server, then reads from it until either side
//!   closes.
//! - **Server**: listens on a port and accepts any number of peers, each with
//!   its own receive loop.
//!
//! All I/O runs on Tokio tasks. Callers observe progress through the event
//! channel; only validation and immediate operational failures are returned
//! directly.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use futures::future::join_all;
use smallvec::{smallvec, SmallVec};
use sockmux_core::{
    validate_host, validate_port, ActionEvent, AtomicSocketState, Endpoint, EndpointRegistry,
    EventChannel, EventReceiver, Host, OperationKind, ReceiveEvent, RemoteConnection, Role,
    SessionConfig, SessionEvent, SocketState, SockmuxError, SockmuxResult, TimeoutEvent,
    TimeoutScheduler,
};
use tokio::net::TcpStream;
use tokio::task::AbortHandle;
use tracing::{debug, info};

use crate::connection;
use crate::encoding::TextEncoding;
use crate::listener;

type Targets = SmallVec<[RemoteConnection; 4]>;

// ----------------------------------------------------------------------------
// Shared Session State
// ----------------------------------------------------------------------------

/// State shared between the session handle and its I/O tasks
pub(crate) struct SessionShared {
    pub(crate) role: Role,
    pub(crate) config: SessionConfig,
    pub(crate) registry: EndpointRegistry,
    pub(crate) scheduler: TimeoutScheduler,
    pub(crate) events: EventChannel,
    state: AtomicSocketState,
    timeout_ms: AtomicU64,
    disposed: AtomicBool,
    local_addr: OnceLock<SocketAddr>,
    accept_task: Mutex<Option<AbortHandle>>,
}

impl SessionShared {
    fn new(role: Role, config: SessionConfig, events: EventChannel) -> Arc<Self> {
        Arc::new(Self {
            role,
            timeout_ms: AtomicU64::new(duration_to_ms(config.timeout)),
            config,
            registry: EndpointRegistry::new(),
            scheduler: TimeoutScheduler::new(events.clone()),
            events,
            state: AtomicSocketState::new(SocketState::Idle),
            disposed: AtomicBool::new(false),
            local_addr: OnceLock::new(),
            accept_task: Mutex::new(None),
        })
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub(crate) fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    /// A client session has nothing left once its only peer is gone
    pub(crate) fn on_peer_lost(&self) {
        if self.role == Role::Client {
            self.state.transition(SocketState::Closed);
        }
    }

    fn set_accept_task(&self, task: AbortHandle) {
        let mut slot = self
            .accept_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.is_disposed() {
            task.abort();
        } else {
            *slot = Some(task);
        }
    }

    /// Tear everything down; only the first call does any work
    fn shutdown(&self) -> bool {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.state.transition(SocketState::Closing);

        let accept = self
            .accept_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(accept) = accept {
            accept.abort();
        }

        self.events.seal();
        let released = self.scheduler.cancel_all();
        let closed = self.registry.clear();
        self.state.transition(SocketState::Closed);

        info!(
            "{} session closed ({} connections, {} pending operations released)",
            self.role,
            closed.len(),
            released
        );
        true
    }
}

fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ----------------------------------------------------------------------------
// Session Builder
// ----------------------------------------------------------------------------

/// Prepares a session so subscribers are in place before the first event
///
/// ```rust,no_run
/// use sockmux_runtime::{Session, SessionConfig};
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let builder = Session::builder(SessionConfig::default());
/// let mut events = builder.subscribe();
/// let session = builder
///     .on_received(|e| println!("{} sent {} bytes", e.endpoint, e.bytes.len()))
///     .connect("127.0.0.1", 41000)
///     .await?;
/// # drop(events.recv().await);
/// # drop(session);
/// # Ok(())
/// # }
/// ```
pub struct SessionBuilder {
    config: SessionConfig,
    events: EventChannel,
}

impl SessionBuilder {
    pub fn new(config: SessionConfig) -> Self {
        let events = EventChannel::new(config.event_buffer_size);
        Self { config, events }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Receiver of every event the session will publish
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub fn on_connected<F>(self, handler: F) -> Self
    where
        F: Fn(&ActionEvent) + Send + Sync + 'static,
    {
        self.events.on_connected(handler);
        self
    }

    pub fn on_accepted<F>(self, handler: F) -> Self
    where
        F: Fn(&ActionEvent) + Send + Sync + 'static,
    {
        self.events.on_accepted(handler);
        self
    }

    pub fn on_sent<F>(self, handler: F) -> Self
    where
        F: Fn(&ActionEvent) + Send + Sync + 'static,
    {
        self.events.on_sent(handler);
        self
    }

    pub fn on_received<F>(self, handler: F) -> Self
    where
        F: Fn(&ReceiveEvent) + Send + Sync + 'static,
    {
        self.events.on_received(handler);
        self
    }

    pub fn on_disconnected<F>(self, handler: F) -> Self
    where
        F: Fn(&ActionEvent) + Send + Sync + 'static,
    {
        self.events.on_disconnected(handler);
        self
    }

    pub fn on_timed_out<F>(self, handler: F) -> Self
    where
        F: Fn(&TimeoutEvent) + Send + Sync + 'static,
    {
        self.events.on_timed_out(handler);
        self
    }

    /// Dial `address:port` and start a client session
    ///
    /// The address and port are validated before any socket is created. A
    /// failed or timed-out connect returns an error and never publishes
    /// Connected.
    pub async fn connect(self, address: &str, port: u32) -> SockmuxResult<Session> {
        let SessionBuilder { config, events } = self;
        config.validate()?;
        let host = validate_host(address)?;
        let port = validate_port(port, false)?;
        let target = resolve(&host, port).await?;

        let shared = SessionShared::new(Role::Client, config, events);
        shared.state.transition(SocketState::Connecting);

        let endpoint = Endpoint::from(target);
        debug!("Connecting to {} ({})", endpoint, host);
        let connected = shared
            .scheduler
            .track(endpoint, OperationKind::Connect, shared.timeout(), async {
                TcpStream::connect(target)
                    .await
                    .map_err(|source| SockmuxError::ConnectFailed { endpoint, source })
            })
            .await;

        let stream = match connected {
            Ok(stream) => stream,
            Err(e) => {
                shared.shutdown();
                return Err(e);
            }
        };

        if let Ok(local) = stream.local_addr() {
            let _ = shared.local_addr.set(local);
        }
        let peer = stream.peer_addr().map(Endpoint::from).unwrap_or(endpoint);

        shared.state.transition(SocketState::Open);
        connection::attach(&shared, stream, peer, SessionEvent::connected);
        info!("Connected to {}", peer);

        Ok(Session { shared })
    }

    /// Bind `port` and start accepting clients
    ///
    /// Port 0 binds an OS-assigned port; see [`Session::local_addr`].
    pub async fn listen(self, port: u32) -> SockmuxResult<Session> {
        let SessionBuilder { config, events } = self;
        config.validate()?;
        let port = validate_port(port, true)?;
        let listener = listener::bind(port, &config)?;

        let shared = SessionShared::new(Role::Server, config, events);
        if let Ok(local) = listener.local_addr() {
            let _ = shared.local_addr.set(local);
        }
        shared.state.transition(SocketState::Accepting);

        let accept = tokio::spawn(listener::accept_loop(shared.clone(), listener));
        shared.set_accept_task(accept.abort_handle());

        match shared.local_addr.get() {
            Some(local) => info!("Listening on {}", local),
            None => info!("Listening on port {}", port),
        }
        Ok(Session { shared })
    }
}

async fn resolve(host: &Host, port: u16) -> SockmuxResult<SocketAddr> {
    let name = match host {
        Host::Ip(ip) => return Ok(SocketAddr::new(*ip, port)),
        Host::Name(name) => name,
    };

    let mut addrs = tokio::net::lookup_host((name.as_str(), port))
        .await
        .map_err(|source| SockmuxError::ResolveFailed {
            address: name.clone(),
            source,
        })?;
    addrs.next().ok_or_else(|| SockmuxError::ResolveFailed {
        address: name.clone(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses found"),
    })
}

// ----------------------------------------------------------------------------
// Session
// ----------------------------------------------------------------------------

/// A client or server TCP session
///
/// Dropping the session closes it.
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    pub fn builder(config: SessionConfig) -> SessionBuilder {
        SessionBuilder::new(config)
    }

    /// Connect to a server
    pub async fn connect(address: &str, port: u32, config: SessionConfig) -> SockmuxResult<Self> {
        SessionBuilder::new(config).connect(address, port).await
    }

    /// Connect with a deadline given in milliseconds
    pub async fn connect_with_timeout(address: &str, port: u32, timeout_ms: u64) -> SockmuxResult<Self> {
        Self::connect(address, port, SessionConfig::default().with_timeout_ms(timeout_ms)).await
    }

    /// Listen for clients
    pub async fn listen(port: u32, config: SessionConfig) -> SockmuxResult<Self> {
        SessionBuilder::new(config).listen(port).await
    }

    pub async fn listen_with_timeout(port: u32, timeout_ms: u64) -> SockmuxResult<Self> {
        Self::listen(port, SessionConfig::default().with_timeout_ms(timeout_ms)).await
    }

    // ---- Properties ----

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Deadline applied to each Connect and Send
    pub fn timeout(&self) -> Duration {
        self.shared.timeout()
    }

    /// Change the deadline for operations started from now on
    pub fn set_timeout(&self, timeout: Duration) {
        self.shared
            .timeout_ms
            .store(duration_to_ms(timeout).max(1), Ordering::Relaxed);
    }

    /// Snapshot of the connected peers
    ///
    /// A client lists its server while the connection is up.
    pub fn remotes(&self) -> Vec<Endpoint> {
        self.shared.registry.list()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr.get().copied()
    }

    pub fn state(&self) -> SocketState {
        self.shared.state.load()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_disposed()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    // ---- Sending ----

    /// Send bytes to one peer or, for a server without a target, to all peers
    ///
    /// A client always sends to its server and ignores `target`. Each target
    /// is written concurrently under its own deadline and publishes Sent when
    /// its write completes. A send that outlives its deadline returns the
    /// time-out but still finishes in the background. A broadcast is best effort: every peer is tried,
    /// and if some fail the result is [`SockmuxError::PartialBroadcast`].
    /// An empty payload succeeds without touching the network.
    pub async fn send(&self, bytes: &[u8], target: Option<Endpoint>) -> SockmuxResult<()> {
        if self.shared.is_disposed() {
            return Err(SockmuxError::Disposed);
        }
        let targets = self.targets(target)?;
        if bytes.is_empty() {
            return Ok(());
        }

        let payload: Arc<[u8]> = Arc::from(bytes);
        if targets.len() == 1 {
            let peer = targets.into_iter().next().ok_or(SockmuxError::NotConnected)?;
            return connection::deliver(&self.shared, peer, payload).await;
        }

        let total = targets.len();
        let results = join_all(
            targets
                .into_iter()
                .map(|peer| connection::deliver(&self.shared, peer, payload.clone())),
        )
        .await;

        let delivered = results.iter().filter(|r| r.is_ok()).count();
        if delivered == total {
            Ok(())
        } else {
            Err(SockmuxError::PartialBroadcast { delivered, total })
        }
    }

    /// Encode `text` (UTF-8 unless told otherwise) and send it
    pub async fn send_text(
        &self,
        text: &str,
        encoding: Option<TextEncoding>,
        target: Option<Endpoint>,
    ) -> SockmuxResult<()> {
        let bytes = encoding.unwrap_or_default().encode(text);
        self.send(&bytes, target).await
    }

    fn targets(&self, target: Option<Endpoint>) -> SockmuxResult<Targets> {
        let registry = &self.shared.registry;
        match (self.shared.role, target) {
            (Role::Client, _) => registry
                .all()
                .into_iter()
                .next()
                .map(|(_, connection)| smallvec![connection])
                .ok_or(SockmuxError::NotConnected),
            (Role::Server, Some(endpoint)) => registry
                .get(&endpoint)
                .map(|connection| smallvec![connection])
                .ok_or(SockmuxError::TargetNotFound { endpoint }),
            (Role::Server, None) => {
                let all: Targets = registry.all().into_iter().map(|(_, c)| c).collect();
                if all.is_empty() {
                    Err(SockmuxError::NoConnectedPeers)
                } else {
                    Ok(all)
                }
            }
        }
    }

    // ---- Events ----

    /// Receiver of every event published from now on
    pub fn subscribe(&self) -> EventReceiver {
        self.shared.events.subscribe()
    }

    pub fn on_connected<F>(&self, handler: F)
    where
        F: Fn(&ActionEvent) + Send + Sync + 'static,
    {
        self.shared.events.on_connected(handler);
    }

    pub fn on_accepted<F>(&self, handler: F)
    where
        F: Fn(&ActionEvent) + Send + Sync + 'static,
    {
        self.shared.events.on_accepted(handler);
    }

    pub fn on_sent<F>(&self, handler: F)
    where
        F: Fn(&ActionEvent) + Send + Sync + 'static,
    {
        self.shared.events.on_sent(handler);
    }

    pub fn on_received<F>(&self, handler: F)
    where
        F: Fn(&ReceiveEvent) + Send + Sync + 'static,
    {
        self.shared.events.on_received(handler);
    }

    pub fn on_disconnected<F>(&self, handler: F)
    where
        F: Fn(&ActionEvent) + Send + Sync + 'static,
    {
        self.shared.events.on_disconnected(handler);
    }

    pub fn on_timed_out<F>(&self, handler: F)
    where
        F: Fn(&TimeoutEvent) + Send + Sync + 'static,
    {
        self.shared.events.on_timed_out(handler);
    }

    // ---- Disposal ----

    /// Stop all I/O and release every socket; later calls do nothing
    pub fn close(&self) {
        self.shared.shutdown();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role())
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .field("remotes", &self.remotes())
            .finish()
    }
}
