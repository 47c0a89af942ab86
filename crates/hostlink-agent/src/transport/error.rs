//! Transport error types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Error body the backend returns with 4xx responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ApiErrorBody {
    /// Parse a 4xx body, falling back to the raw text when it is not JSON.
    pub fn parse(body: &[u8]) -> Self {
        serde_json::from_slice(body).unwrap_or_else(|_| Self {
            error: String::from_utf8_lossy(body).trim().to_string(),
            code: None,
            message: None,
        })
    }
}

impl fmt::Display for ApiErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.error.is_empty() {
            "unknown error"
        } else {
            &self.error
        })?;
        if let Some(code) = &self.code {
            write!(f, " [{code}]")?;
        }
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

/// Errors returned by the transport client.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server error ({status}) after {attempts} attempts")]
    Server { status: u16, attempts: u32 },

    #[error("Client error ({status}): {body}")]
    Client { status: u16, body: ApiErrorBody },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Transport closed")]
    Closed,

    #[error("Failed to encode request body: {0}")]
    Encode(serde_json::Error),

    #[error("Failed to decode response body: {0}")]
    Decode(serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Security(#[from] hostlink_security::SecurityError),
}

impl TransportError {
    /// Whether a later retry might succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Http(_) | Self::Server { .. } | Self::Closed)
    }

    /// HTTP status, when the server answered.
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Server { status, .. } | Self::Client { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_structured_error_body() {
        let body = ApiErrorBody::parse(br#"{"error":"invalid","code":"E42","message":"bad id"}"#);
        assert_eq!(body.error, "invalid");
        assert_eq!(body.code.as_deref(), Some("E42"));
        assert_eq!(body.to_string(), "invalid [E42]: bad id");
    }

    #[test]
    fn falls_back_to_raw_text() {
        let body = ApiErrorBody::parse(b"  Not Found \n");
        assert_eq!(body.error, "Not Found");
        assert!(body.code.is_none());
    }

    #[test]
    fn classification() {
        let client = TransportError::Client {
            status: 404,
            body: ApiErrorBody::default(),
        };
        assert!(!client.is_transient());
        assert_eq!(client.status(), Some(404));

        let server = TransportError::Server {
            status: 503,
            attempts: 4,
        };
        assert!(server.is_transient());
        assert!(!TransportError::Cancelled.is_transient());
    }
}
