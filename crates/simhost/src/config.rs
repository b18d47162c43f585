//! Supervisor and launch configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::forwarder::ForwarderConfig;

pub const SIMULATION_CONFIG_FILE: &str = "simulation_config.json";

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|s| *s >= 0.0)
        .map(Duration::from_secs_f64)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Parent directory of every run directory.
    pub runs_root: PathBuf,
    /// Monitor tick.
    pub poll_interval: Duration,
    /// Wait after SIGTERM before escalating on `stop`.
    pub stop_grace: Duration,
    /// Wait after SIGKILL before reporting a stop timeout.
    pub kill_wait: Duration,
    /// Wait after SIGTERM before escalating during host shutdown.
    pub shutdown_grace: Duration,
    pub recent_actions_capacity: usize,
    /// Trailing bytes of the worker log kept as failure diagnostic.
    pub error_excerpt_bytes: usize,
    /// Round spread between platforms above which a warning is logged.
    pub round_skew_tolerance: Option<u32>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            runs_root: std::env::var_os("SIMHOST_RUNS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("simulations")),
            poll_interval: env_secs("SIMHOST_POLL_INTERVAL").unwrap_or(Duration::from_secs(2)),
            stop_grace: env_secs("SIMHOST_STOP_GRACE").unwrap_or(Duration::from_secs(10)),
            kill_wait: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
            recent_actions_capacity: env_parse("SIMHOST_RECENT_ACTIONS").unwrap_or(50),
            error_excerpt_bytes: 2000,
            round_skew_tolerance: env_parse("SIMHOST_ROUND_SKEW"),
        }
    }
}

impl SupervisorConfig {
    pub fn new(runs_root: impl Into<PathBuf>) -> Self {
        Self {
            runs_root: runs_root.into(),
            ..Self::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_kill_wait(mut self, wait: Duration) -> Self {
        self.kill_wait = wait;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_recent_actions_capacity(mut self, capacity: usize) -> Self {
        self.recent_actions_capacity = capacity;
        self
    }

    pub fn with_error_excerpt_bytes(mut self, bytes: usize) -> Self {
        self.error_excerpt_bytes = bytes;
        self
    }

    pub fn with_round_skew_tolerance(mut self, rounds: Option<u32>) -> Self {
        self.round_skew_tolerance = rounds;
        self
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_root.join(run_id)
    }
}

/// How to launch the worker for one run.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    /// Arguments placed before `--config`.
    pub args: Vec<String>,
    /// Platforms the worker drives; one action log each.
    pub platforms: Vec<String>,
    /// Defaults to `simulation_config.json` in the run directory.
    pub config_file: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub forwarder: Option<ForwarderConfig>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            platforms: Vec::new(),
            config_file: None,
            env: Vec::new(),
            forwarder: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn platform(mut self, platform: impl Into<String>) -> Self {
        self.platforms.push(platform.into());
        self
    }

    pub fn with_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_file = Some(path.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_forwarder(mut self, config: ForwarderConfig) -> Self {
        self.forwarder = Some(config);
        self
    }

    pub fn config_path(&self, run_dir: &Path) -> PathBuf {
        match &self.config_file {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => run_dir.join(path),
            None => run_dir.join(SIMULATION_CONFIG_FILE),
        }
    }
}

fn default_total_hours() -> f64 {
    72.0
}

fn default_minutes_per_round() -> u32 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimeConfig {
    #[serde(default = "default_total_hours")]
    pub total_simulation_hours: f64,
    #[serde(default = "default_minutes_per_round")]
    pub minutes_per_round: u32,
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            total_simulation_hours: default_total_hours(),
            minutes_per_round: default_minutes_per_round(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub agent_id: u64,
    #[serde(default)]
    pub entity_name: Option<String>,
}

/// The precomputed per-run configuration the worker is launched with.
///
/// Only the fields the supervisor needs are decoded; the rest belongs to the worker.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SimulationConfig {
    #[serde(default)]
    pub time_config: TimeConfig,
    #[serde(default)]
    pub agent_configs: Vec<AgentConfig>,
}

impl SimulationConfig {
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Rounds implied by duration and round length, capped by `max_rounds` when positive.
    pub fn round_budget(&self, max_rounds: Option<u32>) -> u32 {
        let minutes = self.time_config.minutes_per_round.max(1);
        let total = (self.time_config.total_simulation_hours * 60.0 / f64::from(minutes)) as u32;
        match max_rounds {
            Some(cap) if cap > 0 => total.min(cap),
            _ => total,
        }
    }

    pub fn agent_ids(&self) -> Vec<u64> {
        self.agent_configs.iter().map(|a| a.agent_id).collect()
    }
}
