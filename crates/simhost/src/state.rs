//! Run state data model.
//!
//! `RunState` is the aggregate view of one supervised run. Only the supervisor
//! mutates it; every change is snapshotted through [`crate::store::RunStateStore`].

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::action::AgentAction;

/// Lifecycle of a supervised run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Idle,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Completed | Self::Failed)
    }

    /// Statuses that make a second `start` for the same run a duplicate.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Paused)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-platform progress counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformProgress {
    pub current_round: u32,
    pub simulated_hours: f64,
    pub running: bool,
    /// Set once the platform has emitted any record.
    pub started: bool,
    /// Set once the terminal event was observed.
    pub completed: bool,
    pub actions_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_total_rounds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_total_actions: Option<u64>,
}

/// Aggregate of a single round across platforms.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundSummary {
    pub round_num: u32,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub simulated_hour: u32,
    #[serde(default)]
    pub platform_actions: BTreeMap<String, u64>,
    #[serde(default)]
    pub active_agents: Vec<u64>,
    #[serde(default)]
    pub actions_count: u64,
}

impl RoundSummary {
    pub fn new(round_num: u32) -> Self {
        Self {
            round_num,
            ..Default::default()
        }
    }

    pub fn record(&mut self, action: &AgentAction) {
        *self
            .platform_actions
            .entry(action.platform.clone())
            .or_insert(0) += 1;
        if !self.active_agents.contains(&action.agent_id) {
            self.active_agents.push(action.agent_id);
        }
        self.actions_count += 1;
    }
}

fn default_recent_capacity() -> usize {
    50
}

fn default_minutes_per_round() -> u32 {
    30
}

/// Durable aggregate state of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub status: RunStatus,
    pub current_round: u32,
    pub total_rounds: u32,
    pub simulated_hours: f64,
    pub total_simulation_hours: f64,
    #[serde(default = "default_minutes_per_round")]
    pub minutes_per_round: u32,
    pub platforms: BTreeMap<String, PlatformProgress>,
    /// Most recent actions, newest first.
    pub recent_actions: VecDeque<AgentAction>,
    #[serde(default = "default_recent_capacity")]
    pub recent_capacity: usize,
    #[serde(default)]
    pub rounds: BTreeMap<u32, RoundSummary>,
    #[serde(default)]
    pub process_pid: Option<u32>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl RunState {
    pub fn new(run_id: impl Into<String>, platforms: &[String]) -> Self {
        Self {
            run_id: run_id.into(),
            status: RunStatus::Idle,
            current_round: 0,
            total_rounds: 0,
            simulated_hours: 0.0,
            total_simulation_hours: 0.0,
            minutes_per_round: default_minutes_per_round(),
            platforms: platforms
                .iter()
                .map(|p| (p.clone(), PlatformProgress::default()))
                .collect(),
            recent_actions: VecDeque::new(),
            recent_capacity: default_recent_capacity(),
            rounds: BTreeMap::new(),
            process_pid: None,
            started_at: None,
            updated_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    pub fn with_recent_capacity(mut self, capacity: usize) -> Self {
        self.recent_capacity = capacity;
        self
    }

    pub fn set_status(&mut self, status: RunStatus) {
        self.status = status;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Terminal transition: records the completion time and stops every platform.
    pub fn finish(&mut self, status: RunStatus, error: Option<String>) {
        self.status = status;
        if error.is_some() {
            self.error = error;
        }
        for progress in self.platforms.values_mut() {
            progress.running = false;
        }
        let now = Utc::now();
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    pub fn platform_mut(&mut self, platform: &str) -> &mut PlatformProgress {
        self.platforms.entry(platform.to_string()).or_default()
    }

    /// Newest first; the oldest entry is dropped once capacity is exceeded.
    pub fn push_recent(&mut self, action: AgentAction) {
        self.recent_actions.push_front(action);
        self.recent_actions.truncate(self.recent_capacity);
    }

    pub fn total_actions(&self) -> u64 {
        self.platforms.values().map(|p| p.actions_count).sum()
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total_rounds == 0 {
            return 0.0;
        }
        let pct = f64::from(self.current_round) / f64::from(self.total_rounds) * 100.0;
        (pct.min(100.0) * 10.0).round() / 10.0
    }

    /// True when at least one platform started and every started platform
    /// reported its terminal event.
    pub fn all_started_platforms_completed(&self) -> bool {
        let mut started = self.platforms.values().filter(|p| p.started).peekable();
        started.peek().is_some() && started.all(|p| p.completed)
    }

    /// Started platforms still missing their terminal event.
    pub fn incomplete_platforms(&self) -> Vec<String> {
        self.platforms
            .iter()
            .filter(|(_, p)| p.started && !p.completed)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Spread between the most and least advanced running platforms.
    pub fn round_skew(&self) -> u32 {
        let rounds = self
            .platforms
            .values()
            .filter(|p| p.started && !p.completed)
            .map(|p| p.current_round);
        let (min, max) = rounds.fold((u32::MAX, 0), |(lo, hi), r| (lo.min(r), hi.max(r)));
        max.saturating_sub(min.min(max))
    }

    /// Compact status view for operators and the CLI.
    pub fn to_summary(&self) -> serde_json::Value {
        let mut summary = serde_json::json!({
            "run_id": self.run_id,
            "status": self.status.as_str(),
            "current_round": self.current_round,
            "total_rounds": self.total_rounds,
            "progress_percent": self.progress_percent(),
            "simulated_hours": self.simulated_hours,
            "total_simulation_hours": self.total_simulation_hours,
            "total_actions": self.total_actions(),
            "platforms": self.platforms,
        });

        if let Some(pid) = self.process_pid {
            summary["process_pid"] = serde_json::json!(pid);
        }
        if let Some(ref error) = self.error {
            summary["error"] = serde_json::Value::String(error.clone());
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(agent_id: u64, round: u32) -> AgentAction {
        AgentAction {
            round,
            timestamp: format!("2024-01-01T00:00:{agent_id:02}"),
            platform: "twitter".to_string(),
            agent_id,
            agent_name: format!("agent-{agent_id}"),
            action_type: "CREATE_POST".to_string(),
            action_args: serde_json::Map::new(),
            result: None,
            success: true,
        }
    }

    #[test]
    fn status_terminal_and_active() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Stopped.is_terminal());
        assert!(!RunStatus::Stopping.is_terminal());
        assert!(RunStatus::Paused.is_active());
        assert!(!RunStatus::Stopping.is_active());
    }

    #[test]
    fn status_serializes_lowercase() {
        insta::assert_json_snapshot!(
            [RunStatus::Idle, RunStatus::Running, RunStatus::Stopped, RunStatus::Failed],
            @r#"
        [
          "idle",
          "running",
          "stopped",
          "failed"
        ]
        "#
        );
    }

    #[test]
    fn recent_actions_newest_first_and_bounded() {
        let mut state = RunState::new("sim_1", &["twitter".to_string()]).with_recent_capacity(2);
        state.push_recent(action(1, 1));
        state.push_recent(action(2, 1));
        state.push_recent(action(3, 2));

        let ids: Vec<u64> = state.recent_actions.iter().map(|a| a.agent_id).collect();
        assert_eq!(ids, vec![3, 2]);
    }

    #[test]
    fn never_started_platform_does_not_block_completion() {
        let mut state = RunState::new("sim_1", &["a".to_string(), "b".to_string()]);
        assert!(!state.all_started_platforms_completed());

        let a = state.platform_mut("a");
        a.started = true;
        a.completed = true;
        assert!(state.all_started_platforms_completed());

        state.platform_mut("b").started = true;
        assert!(!state.all_started_platforms_completed());
        assert_eq!(state.incomplete_platforms(), vec!["b".to_string()]);
    }

    #[test]
    fn progress_is_capped() {
        let mut state = RunState::new("sim_1", &[]);
        assert_eq!(state.progress_percent(), 0.0);
        state.total_rounds = 3;
        state.current_round = 1;
        assert_eq!(state.progress_percent(), 33.3);
        state.current_round = 7;
        assert_eq!(state.progress_percent(), 100.0);
    }

    #[test]
    fn round_summary_keeps_only_aggregates() {
        let mut summary = RoundSummary::new(1);
        for i in 0..500 {
            summary.record(&action(i % 3, 1));
        }
        assert_eq!(
            summary,
            RoundSummary {
                round_num: 1,
                start_time: None,
                end_time: None,
                simulated_hour: 0,
                platform_actions: BTreeMap::from([("twitter".to_string(), 500)]),
                active_agents: vec![0, 1, 2],
                actions_count: 500,
            }
        );
    }

    #[test]
    fn round_summary_dedups_agents() {
        let mut summary = RoundSummary::new(4);
        summary.record(&action(1, 4));
        summary.record(&action(1, 4));
        summary.record(&action(2, 4));

        assert_eq!(summary.active_agents, vec![1, 2]);
        assert_eq!(summary.actions_count, 3);
        assert_eq!(summary.platform_actions.get("twitter"), Some(&3));
    }
}
