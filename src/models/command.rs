use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ParseEnumError;

/// Command lifecycle state.
///
/// Transitions run left to right (pending → claimed → sent → acknowledged →
/// completed) and never leave a terminal state, with one exception: a failed
/// command with retries remaining may be reset to pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Claimed,
    Sent,
    Acknowledged,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Sent => "sent",
            Self::Acknowledged => "acknowledged",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Expired
        )
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CommandStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => Self::Pending,
            "claimed" => Self::Claimed,
            "sent" => Self::Sent,
            "acknowledged" => Self::Acknowledged,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            "expired" => Self::Expired,
            other => return Err(ParseEnumError::new("command_status", other)),
        })
    }
}

/// A row in `device_commands`.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceCommand {
    pub id: Uuid,
    pub device_id: Uuid,
    pub site_id: Uuid,
    pub command_type: String,
    pub command_params: Option<serde_json::Value>,
    pub status: CommandStatus,
    /// Lower is more urgent; 1 for immediate commands, default 5.
    pub priority: i32,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub result: Option<serde_json::Value>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

/// Parameters for creating a command. `priority` defaults to 5 and
/// `max_retries` to 3.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub device_id: Uuid,
    pub site_id: Uuid,
    pub command_type: String,
    pub command_params: Option<serde_json::Value>,
    pub priority: i32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub expires_in_minutes: Option<i64>,
    pub max_retries: i32,
    pub created_by: Option<Uuid>,
}

impl CommandSpec {
    pub fn new(device_id: Uuid, site_id: Uuid, command_type: impl Into<String>) -> Self {
        Self {
            device_id,
            site_id,
            command_type: command_type.into(),
            command_params: None,
            priority: 5,
            scheduled_at: None,
            expires_in_minutes: None,
            max_retries: 3,
            created_by: None,
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.command_params = Some(params);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn scheduled(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn expires_in(mut self, minutes: i64) -> Self {
        self.expires_in_minutes = Some(minutes);
        self
    }
}

/// Structured outcome of executing one command, as produced by an executor
/// or reported back by the device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: Uuid,
    pub device_id: Uuid,
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl CommandResult {
    pub fn ok(command_id: Uuid, device_id: Uuid, data: Option<serde_json::Value>) -> Self {
        Self {
            command_id,
            device_id,
            success: true,
            data,
            error_code: None,
            error_message: None,
        }
    }

    pub fn err(
        command_id: Uuid,
        device_id: Uuid,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            command_id,
            device_id,
            success: false,
            data: None,
            error_code: Some(code.into()),
            error_message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandStats {
    pub total: i64,
    pub pending: i64,
    pub completed: i64,
    pub failed: i64,
    /// completed / (completed + failed), as a percentage; 0 when no
    /// command has reached either state.
    pub success_rate: f64,
}
