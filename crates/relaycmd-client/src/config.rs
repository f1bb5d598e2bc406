//! Channel timing configuration.
//!
//! The relay endpoint belongs to the connector; [`DEFAULT_URL`] is what front
//! ends fall back to when none is configured.

use std::time::Duration;

/// Default relay endpoint.
pub const DEFAULT_URL: &str = "ws://127.0.0.1:3001/ws/api";
/// Delay before the single reconnect attempt after an unexpected close.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Interval between keepalive pings while connected.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
/// Deadline for the `auth-response`.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(8);
/// Deadline for a `direct-message-response`.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(8);
/// Deadline for the transport to open.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Window within which identical property patches collapse to one effect.
pub const DEDUP_WINDOW: Duration = Duration::from_millis(100);

/// Configuration for a [`Channel`](crate::Channel).
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub reconnect_delay: Duration,
    /// Keepalive period (`Duration::ZERO` disables pings).
    pub keepalive_interval: Duration,
    pub auth_timeout: Duration,
    pub command_timeout: Duration,
    pub connect_timeout: Duration,
    pub dedup_window: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: RECONNECT_DELAY,
            keepalive_interval: KEEPALIVE_INTERVAL,
            auth_timeout: AUTH_TIMEOUT,
            command_timeout: COMMAND_TIMEOUT,
            connect_timeout: CONNECT_TIMEOUT,
            dedup_window: DEDUP_WINDOW,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let cfg = ChannelConfig::default();
        assert_eq!(cfg.reconnect_delay, Duration::from_secs(5));
        assert_eq!(cfg.keepalive_interval, Duration::from_secs(30));
        assert_eq!(cfg.auth_timeout, Duration::from_secs(8));
        assert_eq!(cfg.command_timeout, Duration::from_secs(8));
        assert_eq!(cfg.dedup_window, Duration::from_millis(100));
        assert_eq!(cfg.connect_timeout, Duration::from_secs(5));
    }
}
