//! Durable priority outbox for messages that must reach the backend.

mod drain;
mod error;
mod message;
mod store;

pub use drain::{DrainReport, deliver_pending};
pub use error::QueueError;
pub use message::{QueuedMessage, REQUEUE_STEP, kinds};
pub use store::{DEFAULT_CAPACITY, DEFAULT_MAX_PAYLOAD_BYTES, MessageQueue, QueueConfig, QueueStats};
