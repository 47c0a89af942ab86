//! Messages held by the durable queue.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use hostlink_core::now_millis;
use hostlink_core::time::duration_millis;
use hostlink_security::sha256_hex;

use crate::command::CommandResult;
use crate::transport::endpoints;

/// Message type tags.
pub mod kinds {
    pub const HEARTBEAT: &str = "heartbeat";
    pub const INVENTORY: &str = "inventory";
    pub const COMMAND_RESULT: &str = "command_result";
}

/// Delay added per retry when a message is requeued.
pub const REQUEUE_STEP: Duration = Duration::from_secs(1);

/// A message waiting for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    /// Higher is delivered first.
    pub priority: i32,
    pub payload: serde_json::Value,
    pub endpoint: String,
    pub method: String,
    /// Unix milliseconds when the message was created.
    pub timestamp: i64,
    /// Never delivered at or after this instant.
    pub expires_at: i64,
    pub retries: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_attempt_at: Option<i64>,
    /// Not handed out before this instant.
    #[serde(default)]
    pub next_attempt_at: i64,
    /// SHA-256 of the compact JSON payload.
    pub checksum: String,
}

impl QueuedMessage {
    pub fn new(
        message_type: impl Into<String>,
        priority: i32,
        payload: serde_json::Value,
        endpoint: impl Into<String>,
        ttl: Duration,
        max_retries: u32,
    ) -> Self {
        let now = now_millis();
        let checksum = sha256_hex(payload.to_string());
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            message_type: message_type.into(),
            priority,
            payload,
            endpoint: endpoint.into(),
            method: "POST".to_string(),
            timestamp: now,
            expires_at: now.saturating_add(duration_millis(ttl)),
            retries: 0,
            max_retries,
            last_error: None,
            last_attempt_at: None,
            next_attempt_at: now,
            checksum,
        }
    }

    pub fn heartbeat(payload: serde_json::Value) -> Self {
        Self::new(
            kinds::HEARTBEAT,
            5,
            payload,
            endpoints::HEARTBEAT,
            Duration::from_secs(5 * 60),
            3,
        )
    }

    pub fn inventory(payload: serde_json::Value) -> Self {
        Self::new(
            kinds::INVENTORY,
            8,
            payload,
            endpoints::INVENTORY,
            Duration::from_secs(60 * 60),
            5,
        )
    }

    pub fn command_result(result: &CommandResult) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            kinds::COMMAND_RESULT,
            9,
            serde_json::to_value(result)?,
            endpoints::COMMAND_RESULT,
            Duration::from_secs(30 * 60),
            3,
        ))
    }

    pub const fn is_expired_at(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    pub const fn is_eligible_at(&self, now: i64) -> bool {
        !self.is_expired_at(now) && self.next_attempt_at <= now
    }

    pub fn verify_checksum(&self) -> bool {
        hostlink_security::constant_time_eq(&self.checksum, &sha256_hex(self.payload.to_string()))
    }

    /// Serialized payload size in bytes.
    pub fn payload_len(&self) -> usize {
        self.payload.to_string().len()
    }
}
