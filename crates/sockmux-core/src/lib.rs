//! Sockmux Core
//!
//! Building blocks for the sockmux TCP connection engine: endpoint and state
//! types, session configuration, the endpoint registry, the time-out scheduler
//! and the session event channel. The socket-owning engine itself lives in
//! `sockmux-runtime`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod errors;
pub mod events;
pub mod registry;
pub mod timeout;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{SessionConfig, DEFAULT_LISTEN_BACKLOG, DEFAULT_READ_BUFFER_SIZE, DEFAULT_TIMEOUT};
pub use errors::{SockmuxError, SockmuxResult, TimeoutError};
pub use events::{
    ActionEvent, EventChannel, EventKind, EventReceiver, ReceiveEvent, SessionEvent, TimeoutEvent,
};
pub use registry::{EndpointRegistry, PeerHandle, RemoteConnection};
pub use timeout::{TimeoutHandle, TimeoutScheduler};
pub use types::{
    validate_host, validate_port, AtomicSocketState, Endpoint, Host, OperationId, OperationKind, Role, SocketState,
};
