//! Session and role configuration.

use crate::protocol::MAX_FRAME_SIZE;
use std::time::Duration;
use tether_transport::DEFAULT_BACKLOG;

/// Interval between client keep-alives.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(2000);

/// Receive-idle time after which the server drops a connection.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_millis(3000);

/// Minimum sleep between liveness checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Client connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// What a session does when a handler returns an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HandlerErrorPolicy {
    /// Close the connection.
    #[default]
    Close,
    /// Log the error and keep reading.
    LogAndContinue,
}

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Send a keep-alive after this much send-idle time. `None` disables.
    pub heartbeat_interval: Option<Duration>,
    /// Close after this much receive-idle time. `None` disables.
    pub receive_timeout: Option<Duration>,
    /// Minimum sleep between liveness checks.
    pub poll_interval: Duration,
    /// Maximum frame body size in either direction.
    pub max_frame_size: usize,
    /// Reaction to handler failures.
    pub handler_error_policy: HandlerErrorPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: None,
            receive_timeout: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_frame_size: MAX_FRAME_SIZE,
            handler_error_policy: HandlerErrorPolicy::default(),
        }
    }
}

impl SessionConfig {
    /// Server defaults: enforce the receive timeout, no heartbeat.
    #[must_use]
    pub fn server() -> Self {
        Self::default().with_receive_timeout(DEFAULT_RECEIVE_TIMEOUT)
    }

    /// Client defaults: send heartbeats, no receive timeout.
    #[must_use]
    pub fn client() -> Self {
        Self::default().with_heartbeat_interval(DEFAULT_HEARTBEAT_INTERVAL)
    }

    /// Set the heartbeat interval.
    #[must_use]
    pub const fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    /// Disable heartbeats.
    #[must_use]
    pub const fn without_heartbeat(mut self) -> Self {
        self.heartbeat_interval = None;
        self
    }

    /// Set the receive timeout.
    #[must_use]
    pub const fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = Some(timeout);
        self
    }

    /// Disable the receive timeout.
    #[must_use]
    pub const fn without_receive_timeout(mut self) -> Self {
        self.receive_timeout = None;
        self
    }

    /// Set the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the maximum frame size.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Set the handler error policy.
    #[must_use]
    pub const fn with_handler_error_policy(mut self, policy: HandlerErrorPolicy) -> Self {
        self.handler_error_policy = policy;
        self
    }
}

/// Configuration for a [`Server`](crate::Server).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Settings applied to every accepted connection.
    pub session: SessionConfig,
    /// Listen backlog.
    pub backlog: u32,
    /// Maximum concurrent connections. `None` means unlimited.
    pub max_connections: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::server(),
            backlog: DEFAULT_BACKLOG,
            max_connections: None,
        }
    }
}

impl ServerConfig {
    /// Replace the session settings.
    #[must_use]
    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    /// Set the listen backlog.
    #[must_use]
    pub const fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Cap concurrent connections. Extra connections are accepted and
    /// dropped immediately.
    #[must_use]
    pub const fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }
}

/// Configuration for a [`Client`](crate::Client).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Settings for the client's connection.
    pub session: SessionConfig,
    /// How long to wait for the connection to be established.
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::client(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl ClientConfig {
    /// Replace the session settings.
    #[must_use]
    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    /// Set the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_defaults() {
        let server = ServerConfig::default();
        assert_eq!(server.backlog, 5);
        assert_eq!(server.max_connections, None);
        assert_eq!(
            server.session.receive_timeout,
            Some(Duration::from_millis(3000))
        );
        assert_eq!(server.session.heartbeat_interval, None);

        let client = ClientConfig::default();
        assert_eq!(
            client.session.heartbeat_interval,
            Some(Duration::from_millis(2000))
        );
        assert_eq!(client.session.receive_timeout, None);
        assert_eq!(client.session.poll_interval, Duration::from_millis(10));
    }

    #[test]
    fn test_builders() {
        let session = SessionConfig::client()
            .without_heartbeat()
            .with_receive_timeout(Duration::from_secs(1))
            .with_handler_error_policy(HandlerErrorPolicy::LogAndContinue);

        assert!(session.heartbeat_interval.is_none());
        assert_eq!(session.receive_timeout, Some(Duration::from_secs(1)));
        assert_eq!(
            session.handler_error_policy,
            HandlerErrorPolicy::LogAndContinue
        );
    }
}
