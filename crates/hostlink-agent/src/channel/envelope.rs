//! Wire format of the persistent channel.
//!
//! Every frame is a JSON envelope `{type, id, timestamp, data, error}`.
//! `data` is interpreted according to `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use hostlink_core::now_millis;

use crate::command::{Command, CommandResult};
use crate::system::SystemHealth;

use super::error::ChannelError;

/// Envelope `type` values understood by the agent.
pub mod kinds {
    pub const COMMAND: &str = "command";
    pub const COMMAND_RESULT: &str = "command_result";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id: String,
    /// Unix milliseconds.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: now_millis(),
            data,
            error: None,
        }
    }

    pub fn ping(payload: &Heartbeat) -> Result<Self, ChannelError> {
        Ok(Self::new(kinds::PING, serde_json::to_value(payload)?))
    }

    pub fn pong(payload: &Heartbeat) -> Result<Self, ChannelError> {
        Ok(Self::new(kinds::PONG, serde_json::to_value(payload)?))
    }

    pub fn command_result(result: &CommandResult) -> Result<Self, ChannelError> {
        Ok(Self::new(kinds::COMMAND_RESULT, serde_json::to_value(result)?))
    }

    pub fn parse(frame: &[u8]) -> Result<Self, ChannelError> {
        serde_json::from_slice(frame).map_err(|e| ChannelError::Protocol(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ChannelError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Interpret `data` according to `kind`. Unknown kinds pass through.
    pub fn decode(self) -> Result<ChannelMessage, ChannelError> {
        let invalid = |kind: &str, e: serde_json::Error| {
            ChannelError::Protocol(format!("invalid {kind} payload: {e}"))
        };
        match self.kind.as_str() {
            kinds::COMMAND => serde_json::from_value(self.data)
                .map(ChannelMessage::Command)
                .map_err(|e| invalid(kinds::COMMAND, e)),
            kinds::PING => heartbeat_from(self.data)
                .map(ChannelMessage::Ping)
                .map_err(|e| invalid(kinds::PING, e)),
            kinds::PONG => heartbeat_from(self.data)
                .map(ChannelMessage::Pong)
                .map_err(|e| invalid(kinds::PONG, e)),
            _ => Ok(ChannelMessage::Other(self)),
        }
    }
}

// A bare `{"type":"ping"}` carries no data at all.
fn heartbeat_from(data: Value) -> Result<Heartbeat, serde_json::Error> {
    if data.is_null() {
        Ok(Heartbeat::default())
    } else {
        serde_json::from_value(data)
    }
}

/// Payload of `ping` and `pong` frames.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Heartbeat {
    pub machine_id: String,
    pub status: String,
    pub agent_version: String,
    pub timestamp: i64,
    /// Echoed back unchanged in the matching pong.
    pub ping_seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_health: Option<SystemHealth>,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Command(Command),
    Ping(Heartbeat),
    Pong(Heartbeat),
    /// Any other kind, forwarded to the general message stream.
    Other(Envelope),
}
