//! Security error types.

/// Errors raised by the security layer. All of them are hard rejections.
#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    #[error("Unknown token")]
    UnknownToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Token refresh limit reached ({max})")]
    RefreshLimitExceeded { max: u32 },

    #[error("Rate limit exceeded for {0}")]
    RateLimited(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Payload too large: {size} bytes exceeds limit of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Invalid JSON payload: {0}")]
    InvalidJson(String),

    #[error("Forbidden content: {0}")]
    ForbiddenContent(String),

    #[error("TLS configuration failed: {0}")]
    Tls(String),
}
