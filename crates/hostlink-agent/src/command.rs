//! Commands received from the backend and their results.
//!
//! Execution itself belongs to a [`CommandExecutor`]; this crate only
//! transports commands in and results out.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use hostlink_core::now_millis;

/// A command pushed by the backend over the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
    /// Seconds the executor may spend on the command.
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Success,
    Failed,
    Timeout,
    Rejected,
}

/// Outcome of a command, sent back to the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: String,
    pub machine_id: String,
    pub status: CommandStatus,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Unix milliseconds.
    pub started_at: i64,
    pub completed_at: i64,
}

impl CommandResult {
    pub fn success(command: &Command, machine_id: &str, output: String, started_at: i64) -> Self {
        Self {
            command_id: command.id.clone(),
            machine_id: machine_id.to_string(),
            status: CommandStatus::Success,
            output,
            error: None,
            exit_code: Some(0),
            started_at,
            completed_at: now_millis(),
        }
    }

    pub fn failure(
        command: &Command,
        machine_id: &str,
        status: CommandStatus,
        error: impl Into<String>,
        started_at: i64,
    ) -> Self {
        Self {
            command_id: command.id.clone(),
            machine_id: machine_id.to_string(),
            status,
            output: String::new(),
            error: Some(error.into()),
            exit_code: None,
            started_at,
            completed_at: now_millis(),
        }
    }

    pub const fn duration_ms(&self) -> i64 {
        self.completed_at.saturating_sub(self.started_at)
    }
}

/// Runs commands on behalf of the agent.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: Command) -> CommandResult;
}

/// Executor that refuses every command.
#[derive(Debug, Clone)]
pub struct UnsupportedExecutor {
    machine_id: String,
}

impl UnsupportedExecutor {
    pub fn new(machine_id: impl Into<String>) -> Self {
        Self {
            machine_id: machine_id.into(),
        }
    }
}

#[async_trait]
impl CommandExecutor for UnsupportedExecutor {
    async fn execute(&self, command: Command) -> CommandResult {
        let started = now_millis();
        let reason = format!("command type '{}' is not supported", command.command_type);
        CommandResult::failure(
            &command,
            &self.machine_id,
            CommandStatus::Rejected,
            reason,
            started,
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn command_decodes_with_defaults() {
        let command: Command =
            serde_json::from_str(r#"{"id":"c-1","type":"shell","command":"uptime"}"#).unwrap();
        assert_eq!(command.id, "c-1");
        assert_eq!(command.command_type, "shell");
        assert!(command.args.is_empty());
        assert!(command.timeout.is_none());
    }

    #[test]
    fn result_serializes_status_in_snake_case() {
        let command: Command = serde_json::from_str(r#"{"id":"c-1","type":"x"}"#).unwrap();
        let result = CommandResult::success(&command, "m-1", "ok".into(), 0);
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["command_id"], "c-1");
        assert!(value.get("error").is_none());
        assert!(result.duration_ms() >= 0);
    }

    #[tokio::test]
    async fn unsupported_executor_rejects() {
        let executor = UnsupportedExecutor::new("m-1");
        let command: Command = serde_json::from_str(r#"{"id":"c-9","type":"reboot"}"#).unwrap();
        let result = executor.execute(command).await;
        assert_eq!(result.status, CommandStatus::Rejected);
        assert_eq!(result.machine_id, "m-1");
        assert!(result.error.unwrap().contains("reboot"));
    }
}
