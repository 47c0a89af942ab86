//! Queue error types.

use std::path::PathBuf;

/// Errors returned by the durable queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue is empty")]
    Empty,

    #[error("Message {id} failed permanently after {retries} retries")]
    RetriesExhausted { id: String, retries: u32 },

    #[error("Payload too large: {size} bytes exceeds limit of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Corrupt queue snapshot {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
