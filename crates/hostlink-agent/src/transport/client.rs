//! HTTP request engine for the backend API.
//!
//! Every call is retried on network failures and 5xx responses with linear
//! backoff. 4xx responses are surfaced immediately with the parsed error body.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hostlink_core::config::TransportSettings;
use hostlink_core::now_millis;
use hostlink_security::{SecurityManager, security_headers};

use super::error::{ApiErrorBody, TransportError};
use super::metrics::HttpMetrics;
use super::types::{RegistrationRequest, RegistrationResponse};
use crate::backoff::LinearBackoff;
use crate::command::CommandResult;

/// Endpoint paths relative to the API base URL.
pub mod endpoints {
    pub const REGISTER: &str = "/api/v1/agents/register";
    pub const HEARTBEAT: &str = "/api/v1/agents/heartbeat";
    pub const INVENTORY: &str = "/api/v1/agents/inventory";
    pub const COMMAND_RESULT: &str = "/api/v1/agents/commands/result";
}

/// Success rate below which the transport reports itself unhealthy.
const HEALTHY_SUCCESS_RATE: f64 = 0.8;

/// Header carrying the per-request correlation id.
const REQUEST_ID: &str = "x-request-id";
/// Header carrying the agent build version.
const AGENT_VERSION: &str = "x-agent-version";

/// Configuration for the transport client.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// API base URL (e.g., "<https://backend.example.com>").
    pub base_url: String,
    pub agent_version: String,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub request_timeout: Duration,
    pub user_agent: String,
    /// Bearer token sent until registration issues a new one.
    pub auth_token: Option<String>,
}

impl TransportConfig {
    pub fn new(base_url: impl Into<String>, agent_version: impl Into<String>) -> Self {
        let agent_version = agent_version.into();
        Self {
            base_url: base_url.into(),
            user_agent: format!("hostlink-agent/{agent_version}"),
            agent_version,
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            request_timeout: Duration::from_secs(30),
            auth_token: None,
        }
    }

    #[must_use]
    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }

    #[must_use]
    pub const fn with_settings(mut self, settings: &TransportSettings) -> Self {
        self.max_retries = settings.max_retries;
        self.base_delay = Duration::from_millis(settings.base_delay_ms);
        self.request_timeout = Duration::from_secs(settings.request_timeout_secs);
        self
    }

    pub const fn backoff(&self) -> LinearBackoff {
        LinearBackoff::new(self.base_delay, self.max_retries)
    }
}

/// A successful response.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
    /// Attempts it took, including the successful one.
    pub attempts: u32,
}

impl TransportResponse {
    /// Decode the body as JSON. An empty body decodes as `null`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        let body: &[u8] = if self.body.iter().all(u8::is_ascii_whitespace) {
            b"null"
        } else {
            &self.body
        };
        serde_json::from_slice(body).map_err(TransportError::Decode)
    }
}

/// Retrying HTTP client.
pub struct TransportClient {
    http: RwLock<Option<reqwest::Client>>,
    base_url: String,
    backoff: LinearBackoff,
    token: RwLock<Option<String>>,
    metrics: RwLock<HttpMetrics>,
}

impl TransportClient {
    /// Build a client. With a security manager, TLS follows its trust policy.
    pub fn new(
        config: &TransportConfig,
        security: Option<&Arc<SecurityManager>>,
    ) -> Result<Self, TransportError> {
        if config.base_url.is_empty() {
            return Err(TransportError::Config("base_url is empty".into()));
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            HeaderName::from_static(AGENT_VERSION),
            HeaderValue::from_str(&config.agent_version)
                .map_err(|_| TransportError::Config("Invalid agent version".into()))?,
        );
        for &(name, value) in security_headers() {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Config(e.to_string()))?;
            headers.insert(name, HeaderValue::from_static(value));
        }

        // reqwest is built without a default crypto provider; an `Err` here
        // only means one is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone());
        if let Some(security) = security {
            let tls = security.client_config()?;
            builder = builder.use_preconfigured_tls((*tls).clone());
        }
        let http = builder.build()?;

        Ok(Self {
            http: RwLock::new(Some(http)),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            backoff: config.backoff(),
            token: RwLock::new(config.auth_token.clone()),
            metrics: RwLock::new(HttpMetrics::default()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn set_token(&self, token: impl Into<String>) {
        *self.token.write().await = Some(token.into());
    }

    pub async fn token(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    pub async fn clear_token(&self) {
        *self.token.write().await = None;
    }

    fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with('/') {
            format!("{}{endpoint}", self.base_url)
        } else {
            format!("{}/{endpoint}", self.base_url)
        }
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        cancel: &CancellationToken,
    ) -> Result<T, TransportError> {
        self.send(Method::GET, endpoint, None, cancel).await?.json()
    }

    pub async fn post<B, T>(
        &self,
        endpoint: &str,
        body: &B,
        cancel: &CancellationToken,
    ) -> Result<T, TransportError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = serde_json::to_vec(body).map_err(TransportError::Encode)?;
        self.send(Method::POST, endpoint, Some(body), cancel)
            .await?
            .json()
    }

    pub async fn put<B, T>(
        &self,
        endpoint: &str,
        body: &B,
        cancel: &CancellationToken,
    ) -> Result<T, TransportError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let body = serde_json::to_vec(body).map_err(TransportError::Encode)?;
        self.send(Method::PUT, endpoint, Some(body), cancel)
            .await?
            .json()
    }

    pub async fn delete<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        cancel: &CancellationToken,
    ) -> Result<T, TransportError> {
        self.send(Method::DELETE, endpoint, None, cancel)
            .await?
            .json()
    }

    /// Issue a request with retries.
    pub async fn send(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Vec<u8>>,
        cancel: &CancellationToken,
    ) -> Result<TransportResponse, TransportError> {
        let http = self.http.read().await.clone().ok_or(TransportError::Closed)?;
        let url = self.url(endpoint);
        let request_id = uuid::Uuid::new_v4().to_string();
        let sent = body.as_ref().map_or(0, Vec::len);
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }

            let mut request = http
                .request(method.clone(), &url)
                .header(REQUEST_ID, &request_id);
            if let Some(token) = self.token.read().await.as_deref() {
                request = request.header(AUTHORIZATION, format!("Bearer {token}"));
            }
            if let Some(body) = &body {
                request = request.body(body.clone());
            }

            let started = Instant::now();
            let outcome = tokio::select! {
                outcome = Self::execute(request) => outcome,
                () = cancel.cancelled() => return Err(TransportError::Cancelled),
            };
            let latency = started.elapsed();

            let error = match outcome {
                Ok((status, bytes)) if status.is_success() => {
                    self.metrics
                        .write()
                        .await
                        .record_success(latency, sent, bytes.len(), now_millis());
                    debug!(
                        %method,
                        endpoint,
                        status = status.as_u16(),
                        attempt,
                        "Request succeeded"
                    );
                    return Ok(TransportResponse {
                        status: status.as_u16(),
                        body: bytes,
                        attempts: attempt + 1,
                    });
                }
                Ok((status, bytes)) if status.is_client_error() => {
                    let body = ApiErrorBody::parse(&bytes);
                    let error = TransportError::Client {
                        status: status.as_u16(),
                        body,
                    };
                    self.metrics.write().await.record_failure(
                        latency,
                        sent,
                        &error.to_string(),
                        now_millis(),
                    );
                    warn!(%method, endpoint, status = status.as_u16(), "Request rejected");
                    return Err(error);
                }
                Ok((status, _)) => TransportError::Server {
                    status: status.as_u16(),
                    attempts: attempt + 1,
                },
                Err(e) => TransportError::Http(e),
            };

            self.metrics
                .write()
                .await
                .record_failure(latency, sent, &error.to_string(), now_millis());

            if !self.backoff.should_retry(attempt) {
                warn!(%method, endpoint, error = %error, attempts = attempt + 1, "Request failed");
                return Err(error);
            }

            let delay = self.backoff.delay_for_attempt(attempt);
            warn!(
                %method,
                endpoint,
                error = %error,
                attempt,
                delay_ms = delay.as_millis(),
                "Retrying request"
            );
            self.metrics.write().await.record_retry();

            tokio::select! {
                () = sleep(delay) => {}
                () = cancel.cancelled() => return Err(TransportError::Cancelled),
            }
            attempt = attempt.saturating_add(1);
        }
    }

    async fn execute(
        request: reqwest::RequestBuilder,
    ) -> Result<(StatusCode, Vec<u8>), reqwest::Error> {
        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        Ok((status, bytes.to_vec()))
    }

    // =========================================================================
    // Agent endpoints
    // =========================================================================

    pub async fn register(
        &self,
        request: &RegistrationRequest,
        cancel: &CancellationToken,
    ) -> Result<RegistrationResponse, TransportError> {
        let response: RegistrationResponse = self.post(endpoints::REGISTER, request, cancel).await?;
        if let Some(token) = &response.token {
            self.set_token(token.clone()).await;
        }
        info!(machine_id = %request.machine_id, "Agent registered");
        Ok(response)
    }

    pub async fn send_heartbeat(
        &self,
        heartbeat: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, TransportError> {
        self.post(endpoints::HEARTBEAT, heartbeat, cancel).await
    }

    pub async fn send_inventory(
        &self,
        inventory: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, TransportError> {
        self.post(endpoints::INVENTORY, inventory, cancel).await
    }

    pub async fn submit_command_result(
        &self,
        result: &CommandResult,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, TransportError> {
        self.post(endpoints::COMMAND_RESULT, result, cancel).await
    }

    // =========================================================================
    // Metrics
    // =========================================================================

    pub async fn metrics(&self) -> HttpMetrics {
        self.metrics.read().await.clone()
    }

    pub async fn reset_metrics(&self) {
        *self.metrics.write().await = HttpMetrics::default();
    }

    pub async fn success_rate(&self) -> f64 {
        self.metrics.read().await.success_rate()
    }

    pub async fn is_healthy(&self) -> bool {
        self.success_rate().await >= HEALTHY_SUCCESS_RATE
    }

    /// Drop the connection pool. Later requests fail with [`TransportError::Closed`].
    pub async fn close(&self) {
        if self.http.write().await.take().is_some() {
            debug!("Transport closed");
        }
    }
}
