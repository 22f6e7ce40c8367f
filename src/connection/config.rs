use std::time::Duration;

use crate::protocol::DEFAULT_MAX_BODY_SIZE;
use crate::writer::WriterConfig;

/// Default interval between keep-alive pings.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Default time to wait for a pong.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Default request deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default handshake deadline.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default TCP connect deadline.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default maximum concurrent inbound handlers.
pub const DEFAULT_MAX_CONCURRENT_HANDLERS: usize = 256;

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Largest accepted frame body.
    pub max_body_size: u32,
    /// Interval between pings. `Duration::ZERO` disables keep-alive.
    pub ping_interval: Duration,
    /// How long to wait for a pong before closing the connection.
    pub ping_timeout: Duration,
    /// Deadline applied to every request; `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// Deadline for the handshake exchange.
    pub handshake_timeout: Duration,
    /// Deadline for establishing the TCP socket.
    pub connect_timeout: Duration,
    /// Inbound requests handled at once; extra requests are refused.
    pub max_concurrent_handlers: usize,
    /// Writer task settings.
    pub writer: WriterConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            ping_interval: DEFAULT_PING_INTERVAL,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            writer: WriterConfig::default(),
        }
    }
}

impl ConnectionConfig {
    /// Set keep-alive interval and timeout.
    pub fn with_ping(mut self, interval: Duration, timeout: Duration) -> Self {
        self.ping_interval = interval;
        self.ping_timeout = timeout;
        self
    }

    /// Turn keep-alive off.
    pub fn without_ping(mut self) -> Self {
        self.ping_interval = Duration::ZERO;
        self
    }

    /// Set the request deadline.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the handshake deadline.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the TCP connect deadline.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the largest accepted frame body.
    pub fn with_max_body_size(mut self, size: u32) -> Self {
        self.max_body_size = size;
        self
    }

    /// Settings for loopback tests and demos: short timeouts everywhere.
    pub fn local() -> Self {
        Self {
            ping_interval: Duration::from_millis(500),
            ping_timeout: Duration::from_secs(1),
            request_timeout: Some(Duration::from_secs(5)),
            handshake_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_millis(500),
            ..Self::default()
        }
    }

    pub(crate) fn keepalive_enabled(&self) -> bool {
        !self.ping_interval.is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.max_body_size, DEFAULT_MAX_BODY_SIZE);
        assert_eq!(config.request_timeout, Some(DEFAULT_REQUEST_TIMEOUT));
        assert!(config.keepalive_enabled());
    }

    #[test]
    fn test_builder_chain() {
        let config = ConnectionConfig::default()
            .with_ping(Duration::from_secs(1), Duration::from_secs(2))
            .with_request_timeout(None)
            .with_max_body_size(1024);

        assert_eq!(config.ping_interval, Duration::from_secs(1));
        assert_eq!(config.ping_timeout, Duration::from_secs(2));
        assert_eq!(config.request_timeout, None);
        assert_eq!(config.max_body_size, 1024);
        assert!(!config.without_ping().keepalive_enabled());
    }
}
