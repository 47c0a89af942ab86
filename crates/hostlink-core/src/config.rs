//! Configuration resolution for Hostlink.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/hostlink/settings.json)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables
//! 5. CLI arguments (applied by the binary, highest priority)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete Hostlink configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub transport: TransportSettings,
    #[serde(default)]
    pub channel: ChannelSettings,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub security: SecuritySettings,
    #[serde(default)]
    pub monitor: MonitorSettings,
}

/// Backend endpoints and agent identity.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    /// Base URL of the HTTP API (e.g. `https://backend.example.com`).
    pub api_url: Option<String>,
    /// URL of the persistent channel (e.g. `wss://backend.example.com/ws/agent`).
    pub channel_url: Option<String>,
    /// Stable machine identifier. Generated when absent.
    pub machine_id: Option<String>,
    /// Bearer token presented to the backend.
    pub auth_token: Option<String>,
    /// Log level filter for the agent.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Request engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub drain_interval_secs: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            request_timeout_secs: 30,
            heartbeat_interval_secs: 60,
            drain_interval_secs: 15,
        }
    }
}

/// Persistent channel tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSettings {
    pub ping_interval_secs: u64,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub max_reconnects: u32,
    pub reconnect_delay_secs: u64,
    pub offline_buffer: usize,
    pub command_buffer: usize,
    pub message_buffer: usize,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            ping_interval_secs: 30,
            read_timeout_secs: 60,
            write_timeout_secs: 30,
            handshake_timeout_secs: 10,
            max_reconnects: 5,
            reconnect_delay_secs: 5,
            offline_buffer: 100,
            command_buffer: 100,
            message_buffer: 100,
        }
    }
}

/// Durable outbox settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Snapshot file. Defaults to the platform data directory.
    pub path: Option<PathBuf>,
    pub capacity: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            path: None,
            capacity: 1000,
        }
    }
}

/// Security manager settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecuritySettings {
    pub token_validity_secs: u64,
    pub max_token_refresh: u32,
    pub token_sweep_interval_secs: u64,
    pub rate_limit_window_secs: u64,
    pub rate_limit_max_requests: usize,
    /// Hex SHA-256 fingerprints of trusted server certificates (DER).
    pub pinned_cert_hashes: Vec<String>,
    /// Host names the agent may talk to. Empty means any.
    pub allowed_hosts: Vec<String>,
    pub max_input_len: usize,
    pub max_json_bytes: usize,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            token_validity_secs: 24 * 60 * 60,
            max_token_refresh: 10,
            token_sweep_interval_secs: 60 * 60,
            rate_limit_window_secs: 60,
            rate_limit_max_requests: 100,
            pinned_cert_hashes: Vec::new(),
            allowed_hosts: Vec::new(),
            max_input_len: 4096,
            max_json_bytes: 10 * 1024 * 1024, // 10 MB
        }
    }
}

/// Health and metrics monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    pub metrics_interval_secs: u64,
    pub health_interval_secs: u64,
    pub alert_interval_secs: u64,
    pub latency_window: usize,
    pub alert_history: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            metrics_interval_secs: 30,
            health_interval_secs: 60,
            alert_interval_secs: 15,
            latency_window: 100,
            alert_history: 100,
        }
    }
}

impl Config {
    /// Check numeric bounds that would otherwise stall a background loop.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("transport.heartbeat_interval_secs", self.transport.heartbeat_interval_secs),
            ("transport.drain_interval_secs", self.transport.drain_interval_secs),
            ("channel.ping_interval_secs", self.channel.ping_interval_secs),
            ("channel.read_timeout_secs", self.channel.read_timeout_secs),
            ("security.rate_limit_window_secs", self.security.rate_limit_window_secs),
            ("security.token_sweep_interval_secs", self.security.token_sweep_interval_secs),
            ("monitor.metrics_interval_secs", self.monitor.metrics_interval_secs),
            ("monitor.health_interval_secs", self.monitor.health_interval_secs),
            ("monitor.alert_interval_secs", self.monitor.alert_interval_secs),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }
        let sizes = [
            ("queue.capacity", self.queue.capacity),
            ("channel.offline_buffer", self.channel.offline_buffer),
            ("channel.command_buffer", self.channel.command_buffer),
            ("channel.message_buffer", self.channel.message_buffer),
            ("security.rate_limit_max_requests", self.security.rate_limit_max_requests),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }

    /// The configured machine id, generating and storing a new one if absent.
    pub fn machine_id_or_generate(&mut self) -> String {
        self.server
            .machine_id
            .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone()
    }
}

/// Configuration source priority (lowest to highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigSource {
    Default = 0,
    Global = 1,
    File = 2,
    Environment = 3,
    Cli = 4,
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            config = load_config_file(&global_path)?;
        }
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(Error::Config(format!(
                "Config file {} does not exist",
                path.display()
            )));
        }
        let overlay = load_config_file(path)?;
        merge_config(&mut config, overlay);
    }

    apply_env_overrides(&mut config);

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".hostlink").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/hostlink/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("hostlink").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    // Optional server fields only override when present
    if overlay.server.api_url.is_some() {
        base.server.api_url = overlay.server.api_url;
    }
    if overlay.server.channel_url.is_some() {
        base.server.channel_url = overlay.server.channel_url;
    }
    if overlay.server.machine_id.is_some() {
        base.server.machine_id = overlay.server.machine_id;
    }
    if overlay.server.auth_token.is_some() {
        base.server.auth_token = overlay.server.auth_token;
    }
    base.server.log_level = overlay.server.log_level;

    if overlay.queue.path.is_some() {
        base.queue.path = overlay.queue.path;
    }
    base.queue.capacity = overlay.queue.capacity;

    base.transport = overlay.transport;
    base.channel = overlay.channel;
    base.security = overlay.security;
    base.monitor = overlay.monitor;
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("HOSTLINK_API_URL") {
        config.server.api_url = Some(val);
    }
    if let Ok(val) = std::env::var("HOSTLINK_CHANNEL_URL") {
        config.server.channel_url = Some(val);
    }
    if let Ok(val) = std::env::var("HOSTLINK_MACHINE_ID") {
        config.server.machine_id = Some(val);
    }
    if let Ok(val) = std::env::var("HOSTLINK_AUTH_TOKEN") {
        config.server.auth_token = Some(val);
    }
    if let Ok(val) = std::env::var("HOSTLINK_QUEUE_PATH") {
        config.queue.path = Some(PathBuf::from(val));
    }
    if let Ok(val) = std::env::var("HOSTLINK_LOG_LEVEL") {
        config.server.log_level = val;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.transport.max_retries, 3);
        assert_eq!(config.transport.base_delay_ms, 1000);
        assert_eq!(config.channel.read_timeout_secs, 60);
        assert_eq!(config.channel.write_timeout_secs, 30);
        assert_eq!(config.queue.capacity, 1000);
        assert_eq!(config.security.token_validity_secs, 86_400);
        assert_eq!(config.security.max_token_refresh, 10);
        assert_eq!(config.security.rate_limit_max_requests, 100);
        assert_eq!(config.security.max_json_bytes, 10 * 1024 * 1024);
        assert_eq!(config.monitor.alert_interval_secs, 15);
    }

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn zero_interval_rejected() {
        let mut config = Config::default();
        config.channel.ping_interval_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("channel.ping_interval_secs"));
    }

    #[test]
    fn zero_capacity_rejected() {
        let mut config = Config::default();
        config.queue.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_file_keeps_section_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let settings = serde_json::json!({
            "server": {"api_url": "https://backend.example.com"},
            "queue": {"path": null, "capacity": 50},
        });
        std::fs::write(&path, settings.to_string()).unwrap();

        let loaded = load_config_file(&path).unwrap();
        assert_eq!(
            loaded.server.api_url.as_deref(),
            Some("https://backend.example.com")
        );
        assert_eq!(loaded.server.log_level, "info");
        assert_eq!(loaded.queue.capacity, 50);
        assert_eq!(loaded.channel.max_reconnects, 5);
    }

    #[test]
    fn unparseable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_config_file(&path), Err(Error::Config(_))));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let result = load_config(Some(Path::new("/nonexistent/hostlink/settings.json")));
        assert!(result.is_err());
    }

    #[test]
    fn merge_keeps_base_values_for_absent_options() {
        let mut base = Config::default();
        base.server.api_url = Some("https://a.example.com".into());
        base.server.machine_id = Some("m-1".into());

        let mut overlay = Config::default();
        overlay.server.channel_url = Some("wss://a.example.com/ws".into());
        overlay.queue.capacity = 10;

        merge_config(&mut base, overlay);
        assert_eq!(base.server.api_url.as_deref(), Some("https://a.example.com"));
        assert_eq!(base.server.machine_id.as_deref(), Some("m-1"));
        assert_eq!(base.server.channel_url.as_deref(), Some("wss://a.example.com/ws"));
        assert_eq!(base.queue.capacity, 10);
    }

    #[test]
    fn machine_id_generated_once() {
        let mut config = Config::default();
        let first = config.machine_id_or_generate();
        let second = config.machine_id_or_generate();
        assert!(!first.is_empty());
        assert_eq!(first, second);
    }
}
