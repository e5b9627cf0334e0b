use crate::domain::command::DeviceCommand;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A command issued to a device that telemetry has not yet confirmed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub command_id: String,
    pub device_id: String,
    pub command: DeviceCommand,
    pub session_id: Option<String>,
    /// Publish attempts so far, including the first
    pub attempts: u32,
    pub issued_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

/// Lifecycle of a command as seen by the issuing session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Confirmed,
    Failed,
    /// Replaced by a newer command to the same device before it resolved
    Superseded,
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CommandStatus::Pending)
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Confirmed => "confirmed",
            CommandStatus::Failed => "failed",
            CommandStatus::Superseded => "superseded",
        };
        f.write_str(name)
    }
}

/// Handle returned to the caller of a command issuance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandHandle {
    pub command_id: String,
    pub device_id: String,
    pub command: DeviceCommand,
    pub status: CommandStatus,
    pub issued_at: DateTime<Utc>,
}

impl From<&PendingCommand> for CommandHandle {
    fn from(pending: &PendingCommand) -> Self {
        CommandHandle {
            command_id: pending.command_id.clone(),
            device_id: pending.device_id.clone(),
            command: pending.command,
            status: CommandStatus::Pending,
            issued_at: pending.issued_at,
        }
    }
}
