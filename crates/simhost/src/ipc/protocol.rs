//! Wire types for the command mailbox.
//!
//! Commands and responses are single JSON documents named `{command_id}.json`.
//! The heartbeat document is rewritten in place by the worker.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    Interview,
    BatchInterview,
    CloseEnv,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interview => "interview",
            Self::BatchInterview => "batch_interview",
            Self::CloseEnv => "close_env",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcCommand {
    pub command_id: String,
    pub command_type: CommandType,
    #[serde(default)]
    pub args: serde_json::Value,
    pub timestamp: String,
}

impl IpcCommand {
    pub fn new(command_type: CommandType, args: serde_json::Value) -> Self {
        Self {
            command_id: uuid::Uuid::new_v4().to_string(),
            command_type,
            args,
            timestamp: now_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl CommandStatus {
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcResponse {
    pub command_id: String,
    pub status: CommandStatus,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub timestamp: String,
}

impl IpcResponse {
    pub fn completed(command_id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            command_id: command_id.into(),
            status: CommandStatus::Completed,
            result: Some(result),
            error: None,
            timestamp: now_rfc3339(),
        }
    }

    pub fn failed(command_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            status: CommandStatus::Failed,
            result: None,
            error: Some(error.into()),
            timestamp: now_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvStatus {
    Alive,
    Stopped,
}

/// Worker liveness document.
///
/// Channel availability travels as `<channel>_available` keys next to `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub status: EnvStatus,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

const AVAILABLE_SUFFIX: &str = "_available";

impl Heartbeat {
    pub fn new<I, S>(status: EnvStatus, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let extra = channels
            .into_iter()
            .map(|c| {
                (
                    format!("{}{AVAILABLE_SUFFIX}", c.as_ref()),
                    serde_json::Value::Bool(status == EnvStatus::Alive),
                )
            })
            .collect();
        Self {
            status,
            timestamp: Some(now_rfc3339()),
            extra,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.status == EnvStatus::Alive
    }

    pub fn is_channel_available(&self, channel: &str) -> bool {
        self.extra
            .get(&format!("{channel}{AVAILABLE_SUFFIX}"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Channels flagged available, in name order.
    pub fn available_channels(&self) -> Vec<String> {
        self.extra
            .iter()
            .filter(|(_, v)| v.as_bool() == Some(true))
            .filter_map(|(k, _)| k.strip_suffix(AVAILABLE_SUFFIX))
            .map(str::to_string)
            .collect()
    }
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}
