//! Error types for `Hostlink` core library.

use thiserror::Error;

/// Result type alias using `Hostlink` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `Hostlink` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
