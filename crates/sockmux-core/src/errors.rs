//! Error types for the sockmux engine
//!
//! Errors fall into three groups: validation errors raised before any socket
//! exists, operational errors raised by the call that detected them, and
//! time-outs delivered on the result path of the operation that expired.
//! Peer-initiated disconnection is not an error and never appears here.

use std::io;
use std::time::Duration;

use crate::types::{Endpoint, OperationKind};

// ----------------------------------------------------------------------------
// Time-out Error
// ----------------------------------------------------------------------------

/// A tracked operation exceeded its deadline
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation} to {endpoint} timed out after {}ms", after.as_millis())]
pub struct TimeoutError {
    /// Endpoint the operation was addressed to
    pub endpoint: Endpoint,
    /// Which operation expired
    pub operation: OperationKind,
    /// Deadline that elapsed
    pub after: Duration,
}

// ----------------------------------------------------------------------------
// Main Error Type
// ----------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SockmuxError {
    // Validation
    #[error("Invalid address: {address:?}")]
    InvalidAddress { address: String },

    #[error("TCP port out of range: {port}")]
    PortOutOfRange { port: u32 },

    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    // Operational
    #[error("Failed to resolve {address}: {source}")]
    ResolveFailed {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("Connect to {endpoint} failed: {source}")]
    ConnectFailed {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    #[error("Failed to bind port {port}: {source}")]
    BindFailed {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("Send to {endpoint} failed: {source}")]
    SendFailed {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    #[error("Not connected")]
    NotConnected,

    #[error("Target not found: {endpoint}")]
    TargetNotFound { endpoint: Endpoint },

    #[error("No connected peers")]
    NoConnectedPeers,

    #[error("Broadcast reached {delivered} of {total} peers")]
    PartialBroadcast { delivered: usize, total: usize },

    #[error("Session is closed")]
    Disposed,

    // Time-out
    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error("Network I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SockmuxError {
    /// Whether this error was raised by argument validation, before any I/O
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SockmuxError::InvalidAddress { .. }
                | SockmuxError::PortOutOfRange { .. }
                | SockmuxError::InvalidConfiguration { .. }
        )
    }

    /// Whether this error is a time-out
    pub fn is_timeout(&self) -> bool {
        matches!(self, SockmuxError::Timeout(_))
    }

    /// The time-out details, if this is a time-out
    pub fn as_timeout(&self) -> Option<&TimeoutError> {
        match self {
            SockmuxError::Timeout(t) => Some(t),
            _ => None,
        }
    }

    pub fn invalid_configuration(reason: impl Into<String>) -> Self {
        SockmuxError::InvalidConfiguration {
            reason: reason.into(),
        }
    }
}

pub type SockmuxResult<T> = Result<T, SockmuxError>;
