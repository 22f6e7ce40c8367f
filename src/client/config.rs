use std::time::Duration;

use crate::connection::ConnectionConfig;
use crate::handshake::HandshakeProperties;

/// Default connect attempts made before `connect` returns.
pub const DEFAULT_SYNC_CONNECT_ATTEMPTS: u32 = 3;

/// Default delay before the first background reconnect.
pub const DEFAULT_INITIAL_RECONNECT_DELAY: Duration = Duration::from_millis(100);

/// Default ceiling for the reconnect delay.
pub const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Agent-side client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Connect + handshake attempts made inside `connect`, back to back.
    pub sync_connect_attempts: u32,
    /// First background reconnect delay; doubles after each failure.
    pub initial_reconnect_delay: Duration,
    /// Upper bound for the reconnect delay.
    pub max_reconnect_delay: Duration,
    /// Give up and close after this many background failures.
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    /// Settings for each underlying connection.
    pub connection: ConnectionConfig,
    /// Properties sent in every handshake.
    pub properties: HandshakeProperties,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            sync_connect_attempts: DEFAULT_SYNC_CONNECT_ATTEMPTS,
            initial_reconnect_delay: DEFAULT_INITIAL_RECONNECT_DELAY,
            max_reconnect_delay: DEFAULT_MAX_RECONNECT_DELAY,
            max_reconnect_attempts: None,
            connection: ConnectionConfig::default(),
            properties: HandshakeProperties::new(),
        }
    }
}

impl ClientConfig {
    /// Set the number of attempts made inside `connect`.
    pub fn with_sync_connect_attempts(mut self, attempts: u32) -> Self {
        self.sync_connect_attempts = attempts;
        self
    }

    /// Set the reconnect backoff range.
    pub fn with_reconnect_delay(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_reconnect_delay = initial;
        self.max_reconnect_delay = max;
        self
    }

    /// Limit background reconnect attempts.
    pub fn with_max_reconnect_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Set per-connection settings.
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    /// Set the handshake properties.
    pub fn with_properties(mut self, properties: HandshakeProperties) -> Self {
        self.properties = properties;
        self
    }
}

/// Backoff bookkeeping for the reconnect loop.
#[derive(Debug, Clone)]
pub(crate) struct ReconnectState {
    pub(crate) failure_count: u32,
    pub(crate) current_delay: Duration,
}

impl ReconnectState {
    pub(crate) fn new(initial_delay: Duration) -> Self {
        Self {
            failure_count: 0,
            current_delay: initial_delay,
        }
    }

    /// Count a failed attempt and double the delay up to `max_delay`.
    pub(crate) fn record_failure(&mut self, max_delay: Duration) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.current_delay = std::cmp::min(self.current_delay.saturating_mul(2), max_delay);
    }

    /// Whether `max_attempts` failures have been reached.
    pub(crate) fn exhausted(&self, max_attempts: Option<u32>) -> bool {
        max_attempts.is_some_and(|max| self.failure_count >= max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.sync_connect_attempts, 3);
        assert_eq!(config.initial_reconnect_delay, Duration::from_millis(100));
        assert_eq!(config.max_reconnect_delay, Duration::from_secs(30));
        assert!(config.max_reconnect_attempts.is_none());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut state = ReconnectState::new(Duration::from_millis(100));
        let max = Duration::from_millis(500);

        state.record_failure(max);
        assert_eq!(state.current_delay, Duration::from_millis(200));
        state.record_failure(max);
        assert_eq!(state.current_delay, Duration::from_millis(400));
        state.record_failure(max);
        assert_eq!(state.current_delay, max);
        state.record_failure(max);
        assert_eq!(state.current_delay, max);
        assert_eq!(state.failure_count, 4);
    }

    #[test]
    fn test_backoff_saturates_on_huge_delay() {
        let mut state = ReconnectState::new(Duration::MAX);
        state.record_failure(Duration::MAX);
        assert_eq!(state.current_delay, Duration::MAX);

        let mut state = ReconnectState::new(Duration::MAX / 2 + Duration::from_secs(1));
        state.record_failure(Duration::from_secs(30));
        assert_eq!(state.current_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_exhausted() {
        let mut state = ReconnectState::new(Duration::from_millis(1));
        assert!(!state.exhausted(None));
        assert!(!state.exhausted(Some(2)));
        state.record_failure(Duration::from_secs(1));
        state.record_failure(Duration::from_secs(1));
        assert!(state.exhausted(Some(2)));
        assert!(!state.exhausted(None));
    }
}
