//! Channel client configuration.

use std::time::Duration;

use hostlink_core::config::ChannelSettings;

use crate::backoff::LinearBackoff;

/// Configuration for the persistent channel to the backend.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// WebSocket URL (e.g., "wss://backend.example.com/ws/agent").
    pub url: String,
    pub machine_id: String,
    pub agent_version: String,
    /// Sent as `Authorization: Bearer <token>` during the handshake.
    pub auth_token: Option<String>,
    pub ping_interval: Duration,
    /// Idle time after which the read loop re-arms. Not an error.
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub handshake_timeout: Duration,
    pub max_reconnects: u32,
    /// Reconnect attempt `n` waits `reconnect_delay * (n + 1)`.
    pub reconnect_delay: Duration,
    /// Messages kept while disconnected. Oldest dropped first.
    pub offline_buffer: usize,
    pub command_buffer: usize,
    pub message_buffer: usize,
}

impl ChannelConfig {
    pub fn new(
        url: impl Into<String>,
        machine_id: impl Into<String>,
        agent_version: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            machine_id: machine_id.into(),
            agent_version: agent_version.into(),
            auth_token: None,
            ping_interval: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            max_reconnects: 5,
            reconnect_delay: Duration::from_secs(5),
            offline_buffer: 100,
            command_buffer: 100,
            message_buffer: 100,
        }
    }

    #[must_use]
    pub fn with_settings(mut self, settings: &ChannelSettings) -> Self {
        self.ping_interval = Duration::from_secs(settings.ping_interval_secs);
        self.read_timeout = Duration::from_secs(settings.read_timeout_secs);
        self.write_timeout = Duration::from_secs(settings.write_timeout_secs);
        self.handshake_timeout = Duration::from_secs(settings.handshake_timeout_secs);
        self.max_reconnects = settings.max_reconnects;
        self.reconnect_delay = Duration::from_secs(settings.reconnect_delay_secs);
        self.offline_buffer = settings.offline_buffer;
        self.command_buffer = settings.command_buffer;
        self.message_buffer = settings.message_buffer;
        self
    }

    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub const fn reconnect_backoff(&self) -> LinearBackoff {
        LinearBackoff::new(self.reconnect_delay, self.max_reconnects)
    }
}
