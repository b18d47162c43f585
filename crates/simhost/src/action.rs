//! Action log records.
//!
//! Each platform's `actions.jsonl` mixes two kinds of lines: event records
//! (tagged with `event_type`) and action records (carrying an `agent_id`).

use serde::{Deserialize, Deserializer, Serialize};

/// One agent action as appended by the worker. Immutable once written.
///
/// Workers write `null` for fields they have no value for, so every optional
/// field decodes `null` as its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentAction {
    #[serde(default, alias = "round_num", deserialize_with = "null_as_default")]
    pub round: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub timestamp: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub platform: String,
    pub agent_id: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub agent_name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub action_type: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub action_args: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default = "default_success", deserialize_with = "null_as_success")]
    pub success: bool,
}

fn default_success() -> bool {
    true
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn null_as_success<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(Option::<bool>::deserialize(deserializer)?.unwrap_or_else(default_success))
}

impl AgentAction {
    /// Actions that carry no activity worth reporting downstream.
    pub fn is_idle(&self) -> bool {
        self.action_type.eq_ignore_ascii_case("DO_NOTHING")
    }
}

/// Lifecycle markers emitted by the worker, one stream per platform.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum LogEvent {
    SimulationStart {
        #[serde(default)]
        total_rounds: Option<u32>,
        #[serde(default)]
        agents_count: Option<u64>,
    },
    RoundStart {
        round: u32,
        #[serde(default)]
        simulated_hour: u32,
        #[serde(default)]
        timestamp: Option<String>,
    },
    RoundEnd {
        round: u32,
        #[serde(default)]
        actions_count: Option<u64>,
        #[serde(default)]
        simulated_hours: Option<f64>,
        #[serde(default)]
        timestamp: Option<String>,
    },
    SimulationEnd {
        #[serde(default)]
        total_rounds: Option<u32>,
        #[serde(default)]
        total_actions: Option<u64>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogRecord {
    Event(LogEvent),
    Action(AgentAction),
}

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("record is neither an event nor an action")]
    Untagged,
}

impl LogRecord {
    /// Classify and decode one log line.
    ///
    /// `platform` fills in the action's platform when the line omits it,
    /// since logs are already split per platform.
    pub fn parse(line: &str, platform: &str) -> Result<Self, RecordError> {
        let value: serde_json::Value = serde_json::from_str(line)?;
        let Some(object) = value.as_object() else {
            return Err(RecordError::Untagged);
        };

        if object.contains_key("event_type") {
            return Ok(Self::Event(serde_json::from_value(value)?));
        }

        if object.contains_key("agent_id") {
            let mut action: AgentAction = serde_json::from_value(value)?;
            if action.platform.is_empty() {
                action.platform = platform.to_string();
            }
            return Ok(Self::Action(action));
        }

        Err(RecordError::Untagged)
    }
}
