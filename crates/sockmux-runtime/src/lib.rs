//! Sockmux Runtime
//!
//! The asynchronous TCP connection engine. A [`Session`] either dials one
//! server or listens for many clients, runs a receive loop per connection,
//! tracks Connect and Send against a deadline and reports everything through
//! the session's event channel.
//!
//! ```rust,no_run
//! use sockmux_runtime::{Session, SessionConfig, SessionEvent};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let server = Session::listen(41000, SessionConfig::default()).await?;
//! let mut events = server.subscribe();
//!
//! while let Some(event) = events.recv().await {
//!     if let SessionEvent::Received(e) = event {
//!         server.send(&e.bytes, Some(e.endpoint)).await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod connection;
mod listener;

pub mod encoding;
pub mod session;

pub use encoding::TextEncoding;
pub use session::{Session, SessionBuilder};

// Re-export core types for convenience
pub use sockmux_core::{
    ActionEvent, Endpoint, EventKind, EventReceiver, OperationKind, ReceiveEvent, Role,
    SessionConfig, SessionEvent, SocketState, SockmuxError, SockmuxResult, TimeoutError,
    TimeoutEvent,
};
