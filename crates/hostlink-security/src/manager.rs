//! Security manager composing tokens, rate limiting, trust and sanitation.

use std::sync::Arc;
use std::time::Duration;

use hostlink_core::config::SecuritySettings;
use rustls::ClientConfig;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::SecurityError;
use crate::rate_limit::RateLimiter;
use crate::sanitize::{UrlPolicy, sanitize_input, validate_json, validate_url};
use crate::token::{Token, TokenStore};
use crate::trust::TrustPolicy;

/// Security tuning.
#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub token_validity: Duration,
    pub max_refresh: u32,
    pub sweep_interval: Duration,
    pub rate_limit_window: Duration,
    pub rate_limit_max: usize,
    pub pinned_cert_hashes: Vec<String>,
    pub allowed_hosts: Vec<String>,
    pub max_input_len: usize,
    pub max_json_bytes: usize,
    pub allow_insecure: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self::from_settings(&SecuritySettings::default())
    }
}

impl SecurityConfig {
    pub fn from_settings(settings: &SecuritySettings) -> Self {
        Self {
            token_validity: Duration::from_secs(settings.token_validity_secs),
            max_refresh: settings.max_token_refresh,
            sweep_interval: Duration::from_secs(settings.token_sweep_interval_secs),
            rate_limit_window: Duration::from_secs(settings.rate_limit_window_secs),
            rate_limit_max: settings.rate_limit_max_requests,
            pinned_cert_hashes: settings.pinned_cert_hashes.clone(),
            allowed_hosts: settings.allowed_hosts.clone(),
            max_input_len: settings.max_input_len,
            max_json_bytes: settings.max_json_bytes,
            allow_insecure: false,
        }
    }
}

/// Entry point the other components use for every security decision.
pub struct SecurityManager {
    config: SecurityConfig,
    tokens: TokenStore,
    limiter: RateLimiter,
    trust: TrustPolicy,
}

impl SecurityManager {
    pub fn new(config: SecurityConfig) -> Self {
        let tokens = TokenStore::new(config.token_validity, config.max_refresh);
        let limiter = RateLimiter::new(config.rate_limit_window, config.rate_limit_max);
        let trust = TrustPolicy::new(
            config.pinned_cert_hashes.clone(),
            config.allowed_hosts.clone(),
        );
        Self {
            config,
            tokens,
            limiter,
            trust,
        }
    }

    pub const fn config(&self) -> &SecurityConfig {
        &self.config
    }

    pub const fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    pub const fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub const fn trust(&self) -> &TrustPolicy {
        &self.trust
    }

    pub async fn generate_token(&self, machine_id: &str, scope: &[String]) -> Token {
        self.tokens.generate(machine_id, scope).await
    }

    pub async fn validate_token(&self, value: &str) -> Result<Token, SecurityError> {
        self.tokens.validate(value).await
    }

    pub async fn refresh_token(&self, value: &str) -> Result<Token, SecurityError> {
        self.tokens.refresh(value).await
    }

    pub async fn revoke_token(&self, value: &str) -> bool {
        self.tokens.revoke(value).await
    }

    pub async fn check_rate_limit(&self, id: &str) -> Result<(), SecurityError> {
        self.limiter.check(id).await
    }

    pub fn sanitize_input(&self, input: &str) -> String {
        sanitize_input(input, self.config.max_input_len)
    }

    pub fn url_policy(&self) -> UrlPolicy {
        UrlPolicy {
            allowed_hosts: self.config.allowed_hosts.clone(),
            allow_insecure: self.config.allow_insecure,
        }
    }

    pub fn validate_url(&self, raw: &str) -> Result<url::Url, SecurityError> {
        validate_url(raw, &self.url_policy())
    }

    pub fn validate_json(&self, payload: &[u8]) -> Result<(), SecurityError> {
        validate_json(payload, self.config.max_json_bytes)
    }

    /// TLS client configuration honouring pins and the host allow-list.
    pub fn client_config(&self) -> Result<Arc<ClientConfig>, SecurityError> {
        self.trust.client_config()
    }

    /// Periodically delete expired tokens and idle rate-limit trackers.
    pub fn spawn_token_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // Skip the immediate first tick
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let tokens = manager.tokens.sweep_expired().await;
                        let trackers = manager
                            .limiter
                            .sweep_idle_at(hostlink_core::now_millis())
                            .await;
                        if tokens > 0 || trackers > 0 {
                            debug!(tokens, trackers, "Swept expired security state");
                        }
                    }
                    () = cancel.cancelled() => {
                        info!("Token sweeper stopped");
                        break;
                    }
                }
            }
        })
    }
}
