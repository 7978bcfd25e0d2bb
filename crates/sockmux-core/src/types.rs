//! Core types for sockmux sessions
//!
//! Roles, endpoints, operation kinds, the per-socket state machine and the
//! validation helpers used by session constructors.

use std::fmt;
use std::net::{AddrParseError, IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{SockmuxError, SockmuxResult};

// ----------------------------------------------------------------------------
// Role
// ----------------------------------------------------------------------------

/// Whether a session dials out to one server or accepts many clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}

// ----------------------------------------------------------------------------
// Endpoint
// ----------------------------------------------------------------------------

/// Network address of a remote peer, used as the registry key
///
/// IPv4-mapped IPv6 addresses are stored as plain IPv4, so a peer accepted on
/// a dual-stack listener compares equal to the address it dialled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    pub fn new(addr: SocketAddr) -> Self {
        let addr = match addr {
            SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
                Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
                None => SocketAddr::V6(v6),
            },
            v4 => v4,
        };
        Self(addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.0
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr)
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.0
    }
}

impl FromStr for Endpoint {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<SocketAddr>().map(Self::new)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Operation Kinds and Identifiers
// ----------------------------------------------------------------------------

/// Asynchronous operations that can be tracked against a deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Connect,
    Accept,
    Send,
    Receive,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Connect => write!(f, "Connect"),
            OperationKind::Accept => write!(f, "Accept"),
            OperationKind::Send => write!(f, "Send"),
            OperationKind::Receive => write!(f, "Receive"),
        }
    }
}

/// Identifier of one in-flight operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(Uuid);

impl OperationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Socket State Machine
// ----------------------------------------------------------------------------

/// Lifecycle of a socket owned by a session
///
/// `Idle -> Connecting/Accepting -> Open -> Closing -> Closed`. `Open` is
/// re-entrant for sends while reads continue, and every state may drop
/// straight to `Closed` on error, peer disconnection or disposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SocketState {
    Idle,
    Connecting,
    Accepting,
    Open,
    Closing,
    Closed,
}

impl SocketState {
    pub fn can_transition_to(self, next: SocketState) -> bool {
        use SocketState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Idle, Connecting) | (Idle, Accepting) => true,
            (Connecting, Open) | (Accepting, Open) => true,
            (Open, Open) | (Open, Closing) => true,
            // A listener keeps accepting after each accepted connection.
            (Accepting, Accepting) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == SocketState::Closed
    }

    fn as_u8(self) -> u8 {
        match self {
            SocketState::Idle => 0,
            SocketState::Connecting => 1,
            SocketState::Accepting => 2,
            SocketState::Open => 3,
            SocketState::Closing => 4,
            SocketState::Closed => 5,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => SocketState::Idle,
            1 => SocketState::Connecting,
            2 => SocketState::Accepting,
            3 => SocketState::Open,
            4 => SocketState::Closing,
            _ => SocketState::Closed,
        }
    }
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SocketState::Idle => "idle",
            SocketState::Connecting => "connecting",
            SocketState::Accepting => "accepting",
            SocketState::Open => "open",
            SocketState::Closing => "closing",
            SocketState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Lock-free cell holding a [`SocketState`]
#[derive(Debug)]
pub struct AtomicSocketState(AtomicU8);

impl AtomicSocketState {
    pub fn new(state: SocketState) -> Self {
        Self(AtomicU8::new(state.as_u8()))
    }

    pub fn load(&self) -> SocketState {
        SocketState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Move to `next` if the state machine allows it from the current state
    pub fn transition(&self, next: SocketState) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                SocketState::from_u8(current)
                    .can_transition_to(next)
                    .then_some(next.as_u8())
            })
            .is_ok()
    }
}

// ----------------------------------------------------------------------------
// Validation
// ----------------------------------------------------------------------------

/// A syntactically valid connect target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    Ip(IpAddr),
    Name(String),
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Ip(ip) => write!(f, "{}", ip),
            Host::Name(name) => f.write_str(name),
        }
    }
}

/// Validate a TCP port given as a wide integer
///
/// Port 0 is only meaningful for listeners, where the OS picks a free port.
pub fn validate_port(port: u32, allow_ephemeral: bool) -> SockmuxResult<u16> {
    match u16::try_from(port) {
        Ok(0) if !allow_ephemeral => Err(SockmuxError::PortOutOfRange { port }),
        Ok(p) => Ok(p),
        Err(_) => Err(SockmuxError::PortOutOfRange { port }),
    }
}

/// Validate a connect target: an IP literal or an RFC 1123 host name
pub fn validate_host(address: &str) -> SockmuxResult<Host> {
    let trimmed = address.trim();
    let invalid = || SockmuxError::InvalidAddress {
        address: address.to_string(),
    };

    if trimmed.is_empty() || trimmed.len() != address.len() {
        return Err(invalid());
    }

    // Bracketed IPv6 literals are accepted as well as bare ones.
    let unbracketed = trimmed
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(trimmed);
    if let Ok(ip) = unbracketed.parse::<IpAddr>() {
        return Ok(Host::Ip(ip));
    }

    if trimmed.len() > 253 {
        return Err(invalid());
    }
    let name = trimmed.strip_suffix('.').unwrap_or(trimmed);
    let labels_ok = name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    });
    // All-numeric dotted names are malformed IPv4 literals, not hosts.
    let all_numeric = name
        .split('.')
        .all(|label| label.chars().all(|c| c.is_ascii_digit()));

    if !labels_ok || all_numeric {
        return Err(invalid());
    }
    Ok(Host::Name(name.to_ascii_lowercase()))
}
