//! Commands directed at devices.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};
use crate::limits;
use crate::model::metadata::Metadata;

/// Lifecycle state of a command.
///
/// `pending -> executing -> completed | failed` on the normal path;
/// `timeout` when the supervisor observes `expires_at` in the past, and
/// `cancelled` on explicit withdrawal. All of `completed`, `failed`,
/// `timeout`, `cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Unknown,
    Pending,
    Executing,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Unknown => "unknown",
            CommandStatus::Pending => "pending",
            CommandStatus::Executing => "executing",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
            CommandStatus::Timeout => "timeout",
            CommandStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => CommandStatus::Pending,
            "executing" => CommandStatus::Executing,
            "completed" => CommandStatus::Completed,
            "failed" => CommandStatus::Failed,
            "timeout" => CommandStatus::Timeout,
            "cancelled" => CommandStatus::Cancelled,
            _ => CommandStatus::Unknown,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Completed
                | CommandStatus::Failed
                | CommandStatus::Timeout
                | CommandStatus::Cancelled
        )
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One directive sent to a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    /// Internal row id.
    pub id: String,
    pub device_id: String,
    /// Externally visible command id, unique across the system.
    pub command_id: String,
    pub command_type: String,
    pub parameters: Metadata,
    pub status: CommandStatus,
    /// Higher runs sooner; FIFO within equal priority.
    pub priority: i32,
    pub timeout_seconds: i32,
    pub result: Metadata,
    pub error_message: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub execution_time_ms: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outcome reported by a device for an executed command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    pub message: String,
    pub data: Metadata,
}

impl Command {
    /// Build a new pending command with defaults applied.
    pub fn new(
        device_id: impl Into<String>,
        command_type: impl Into<String>,
        parameters: Metadata,
        priority: i32,
        timeout_seconds: i32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: device_id.into(),
            command_id: uuid::Uuid::new_v4().to_string(),
            command_type: command_type.into(),
            parameters,
            status: CommandStatus::Pending,
            priority,
            timeout_seconds,
            result: Metadata::new(),
            error_message: None,
            submitted_at: now,
            executed_at: None,
            completed_at: None,
            expires_at: Some(now + Duration::seconds(i64::from(timeout_seconds))),
            execution_time_ms: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn validate(&self) -> GatewayResult<()> {
        if self.device_id.is_empty() {
            return Err(GatewayError::validation("device_id is required"));
        }
        if self.command_type.is_empty() {
            return Err(GatewayError::validation("command type is required"));
        }
        if self.timeout_seconds <= 0 {
            return Err(GatewayError::validation("timeout_seconds must be positive"));
        }
        if self.timeout_seconds > limits::MAX_COMMAND_TIMEOUT_SECS {
            return Err(GatewayError::validation(format!(
                "timeout_seconds too large (max {})",
                limits::MAX_COMMAND_TIMEOUT_SECS
            )));
        }
        Ok(())
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Utc::now() > at)
    }

    pub fn can_execute(&self) -> bool {
        self.status == CommandStatus::Pending && !self.is_expired()
    }

    /// `pending -> executing`: stamps `executed_at`.
    pub fn start_execution(&mut self) {
        let now = Utc::now();
        self.status = CommandStatus::Executing;
        self.executed_at = Some(now);
        self.updated_at = now;
    }

    /// `executing -> completed | failed` with the device's result payload.
    pub fn complete_execution(&mut self, result: CommandResult) {
        let now = Utc::now();
        if result.success {
            self.status = CommandStatus::Completed;
        } else {
            self.status = CommandStatus::Failed;
            if !result.message.is_empty() {
                self.error_message = Some(result.message.clone());
            }
        }
        self.completed_at = Some(now);
        self.updated_at = now;
        if let Some(executed_at) = self.executed_at {
            self.execution_time_ms =
                Some((now - executed_at).num_microseconds().unwrap_or(0) as f64 / 1000.0);
        }
        if !result.data.is_empty() {
            self.result = result.data;
        }
    }

    /// Terminal transition applied by the supervisor when `expires_at`
    /// passes without a reply.
    pub fn mark_timeout(&mut self) {
        let now = Utc::now();
        self.status = CommandStatus::Timeout;
        self.completed_at = Some(now);
        self.updated_at = now;
        self.error_message = Some("command execution timed out".to_string());
    }

    pub fn cancel(&mut self, reason: &str) {
        let now = Utc::now();
        self.status = CommandStatus::Cancelled;
        self.completed_at = Some(now);
        self.updated_at = now;
        if !reason.is_empty() {
            self.error_message = Some(reason.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_command_defaults() {
        let cmd = Command::new("d1", "calibrate", Metadata::new(), 1, 30);
        assert_eq!(cmd.status, CommandStatus::Pending);
        assert!(cmd.expires_at.is_some());
        assert!(cmd.can_execute());
        assert!(cmd.validate().is_ok());
    }

    #[test]
    fn test_timeout_bounds() {
        let cmd = Command::new("d1", "calibrate", Metadata::new(), 1, 0);
        assert!(cmd.validate().is_err());
        let cmd = Command::new("d1", "calibrate", Metadata::new(), 1, 3601);
        assert!(cmd.validate().is_err());
    }

    #[test]
    fn test_lifecycle_ordering() {
        let mut cmd = Command::new("d1", "calibrate", Metadata::new(), 1, 30);
        cmd.start_execution();
        assert_eq!(cmd.status, CommandStatus::Executing);

        cmd.complete_execution(CommandResult {
            success: true,
            message: String::new(),
            data: Metadata::new(),
        });
        assert_eq!(cmd.status, CommandStatus::Completed);
        assert!(cmd.execution_time_ms.is_some());

        let executed = cmd.executed_at.unwrap();
        let completed = cmd.completed_at.unwrap();
        assert!(completed >= executed);
        assert!(executed >= cmd.submitted_at);
    }

    #[test]
    fn test_failed_result_records_message() {
        let mut cmd = Command::new("d1", "calibrate", Metadata::new(), 1, 30);
        cmd.start_execution();
        cmd.complete_execution(CommandResult {
            success: false,
            message: "shutter stuck".into(),
            data: Metadata::new(),
        });
        assert_eq!(cmd.status, CommandStatus::Failed);
        assert_eq!(cmd.error_message.as_deref(), Some("shutter stuck"));
    }

    #[test]
    fn test_mark_timeout_is_terminal() {
        let mut cmd = Command::new("d1", "calibrate", Metadata::new(), 1, 30);
        cmd.mark_timeout();
        assert!(cmd.status.is_terminal());
        assert!(cmd.completed_at.is_some());
        assert!(cmd.error_message.is_some());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            CommandStatus::Unknown,
            CommandStatus::Pending,
            CommandStatus::Executing,
            CommandStatus::Completed,
            CommandStatus::Failed,
            CommandStatus::Timeout,
            CommandStatus::Cancelled,
        ] {
            assert_eq!(CommandStatus::parse(status.as_str()), status);
        }
    }
}
