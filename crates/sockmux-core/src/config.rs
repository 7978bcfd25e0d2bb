//! Session configuration
//!
//! Durations are (de)serialized as integer milliseconds so configuration files
//! can say `timeout = 30000`.

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{SockmuxError, SockmuxResult};

/// Capacity of one read, and therefore the largest single Received payload
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

/// Deadline applied to Connect and Send when none is configured
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);

pub const DEFAULT_LISTEN_BACKLOG: u32 = 1000;

// ----------------------------------------------------------------------------
// Duration Serialization Helpers
// ----------------------------------------------------------------------------

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}

// ----------------------------------------------------------------------------
// Session Configuration
// ----------------------------------------------------------------------------

/// Configuration for a client or server session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Deadline for each Connect and Send
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// Bytes requested per read
    pub read_buffer_size: usize,
    /// Optional idle deadline for a pending read (advisory only)
    #[serde(with = "option_duration_ms", skip_serializing_if = "Option::is_none")]
    pub read_timeout: Option<Duration>,
    /// Listen backlog for server sessions
    pub listen_backlog: u32,
    /// Server bind address; dual-stack any-address when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_address: Option<IpAddr>,
    /// Set TCP_NODELAY on every connection
    pub nodelay: bool,
    /// Queue depth of each `subscribe()` receiver
    pub event_buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            read_timeout: None,
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            bind_address: None,
            nodelay: false,
            event_buffer_size: 256,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Short deadlines and a loopback listener, for tests
    pub fn testing() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            bind_address: Some(IpAddr::from([127, 0, 0, 1])),
            nodelay: true,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_timeout_ms(self, millis: u64) -> Self {
        self.with_timeout(Duration::from_millis(millis))
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_listen_backlog(mut self, backlog: u32) -> Self {
        self.listen_backlog = backlog;
        self
    }

    pub fn with_bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = Some(address);
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn with_event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = size;
        self
    }

    pub fn validate(&self) -> SockmuxResult<()> {
        if self.timeout.is_zero() {
            return Err(SockmuxError::invalid_configuration("timeout must be non-zero"));
        }
        if self.read_buffer_size == 0 {
            return Err(SockmuxError::invalid_configuration(
                "read_buffer_size must be non-zero",
            ));
        }
        if self.read_timeout.is_some_and(|t| t.is_zero()) {
            return Err(SockmuxError::invalid_configuration(
                "read_timeout must be non-zero when set",
            ));
        }
        if self.listen_backlog == 0 {
            return Err(SockmuxError::invalid_configuration(
                "listen_backlog must be non-zero",
            ));
        }
        if self.event_buffer_size == 0 {
            return Err(SockmuxError::invalid_configuration(
                "event_buffer_size must be non-zero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.timeout, Duration::from_millis(30_000));
        assert_eq!(config.read_buffer_size, 1024);
        assert_eq!(config.listen_backlog, 1000);
        assert!(config.bind_address.is_none());
        assert!(config.read_timeout.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_and_validation() {
        let config = SessionConfig::new()
            .with_timeout_ms(500)
            .with_read_buffer_size(16)
            .with_nodelay(true);
        assert_eq!(config.timeout, Duration::from_millis(500));
        assert_eq!(config.read_buffer_size, 16);
        assert!(config.nodelay);
        assert!(config.validate().is_ok());

        assert!(SessionConfig::new().with_timeout_ms(0).validate().is_err());
        assert!(SessionConfig::new().with_read_buffer_size(0).validate().is_err());
        assert!(SessionConfig::new().with_listen_backlog(0).validate().is_err());
        assert!(SessionConfig::new().with_event_buffer_size(0).validate().is_err());
        assert!(SessionConfig::new()
            .with_read_timeout(Some(Duration::ZERO))
            .validate()
            .is_err());
    }
}
