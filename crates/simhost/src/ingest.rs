//! Incremental action log ingestion.
//!
//! Every platform log is tailed from a remembered byte offset. The offset only
//! moves past newline-terminated lines, so a line the worker is still writing is
//! picked up whole on a later poll and nothing is ever counted twice.

use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::action::{AgentAction, LogEvent, LogRecord};
use crate::state::{RoundSummary, RunState, RunStatus};

pub const ACTIONS_FILE: &str = "actions.jsonl";

/// Path of a platform's action log inside a run directory.
pub fn action_log_path(run_dir: &Path, platform: &str) -> PathBuf {
    run_dir.join(platform).join(ACTIONS_FILE)
}

/// A line that could not be decoded. Skipped, never fatal.
#[derive(Debug, Clone)]
pub struct MalformedLine {
    pub offset: u64,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct ReadBatch {
    pub records: Vec<LogRecord>,
    pub malformed: Vec<MalformedLine>,
}

/// Tail state for one platform's log.
#[derive(Debug)]
pub struct ActionLog {
    platform: String,
    path: PathBuf,
    offset: u64,
}

impl ActionLog {
    pub fn new(run_dir: &Path, platform: impl Into<String>) -> Self {
        let platform = platform.into();
        Self {
            path: action_log_path(run_dir, &platform),
            platform,
            offset: 0,
        }
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read every complete line appended since the last call.
    ///
    /// A missing file yields an empty batch: the platform has not started yet.
    pub fn read_new(&mut self) -> io::Result<ReadBatch> {
        let mut file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ReadBatch::default()),
            Err(e) => return Err(e),
        };

        let len = file.metadata()?.len();
        if len < self.offset {
            tracing::warn!(
                platform = %self.platform,
                offset = self.offset,
                len,
                "Action log shrank, re-reading from start"
            );
            self.offset = 0;
        }
        if len == self.offset {
            return Ok(ReadBatch::default());
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = Vec::with_capacity((len - self.offset) as usize);
        file.read_to_end(&mut buf)?;

        let Some(last_newline) = buf.iter().rposition(|b| *b == b'\n') else {
            return Ok(ReadBatch::default());
        };
        let complete = &buf[..=last_newline];

        let mut batch = ReadBatch::default();
        let mut line_offset = self.offset;
        for raw in complete.split_inclusive(|b| *b == b'\n') {
            let start = line_offset;
            line_offset += raw.len() as u64;

            let line = String::from_utf8_lossy(raw);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match LogRecord::parse(line, &self.platform) {
                Ok(record) => batch.records.push(record),
                Err(e) => {
                    tracing::debug!(platform = %self.platform, offset = start, error = %e, "Skipping malformed log line");
                    batch.malformed.push(MalformedLine {
                        offset: start,
                        error: e.to_string(),
                    });
                }
            }
        }

        self.offset += complete.len() as u64;
        Ok(batch)
    }
}

/// What one ingest pass changed.
#[derive(Debug, Default)]
pub struct IngestOutcome {
    /// New actions in log order, for side-channel forwarding.
    pub actions: Vec<AgentAction>,
    pub events: usize,
    pub malformed: usize,
    /// Set when this pass observed the last outstanding terminal event.
    pub completed: bool,
}

impl IngestOutcome {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.events == 0
    }
}

/// Tails all platform logs of one run and folds them into its [`RunState`].
#[derive(Debug)]
pub struct ActionIngestor {
    logs: Vec<ActionLog>,
    skew_tolerance: Option<u32>,
    skew_warned: bool,
}

impl ActionIngestor {
    pub fn new(run_dir: &Path, platforms: &[String]) -> Self {
        Self {
            logs: platforms
                .iter()
                .map(|p| ActionLog::new(run_dir, p.clone()))
                .collect(),
            skew_tolerance: None,
            skew_warned: false,
        }
    }

    /// Warn once when running platforms drift further apart than `rounds`.
    pub fn with_skew_tolerance(mut self, rounds: Option<u32>) -> Self {
        self.skew_tolerance = rounds;
        self
    }

    pub fn logs(&self) -> &[ActionLog] {
        &self.logs
    }

    /// Read new lines from every platform without touching state.
    ///
    /// Read errors are logged and the platform is retried on the next call.
    pub fn read_new(&mut self) -> Vec<(String, ReadBatch)> {
        let mut batches = Vec::with_capacity(self.logs.len());
        for log in &mut self.logs {
            match log.read_new() {
                Ok(batch) => batches.push((log.platform.clone(), batch)),
                Err(e) => {
                    tracing::warn!(platform = %log.platform, path = %log.path.display(), error = %e, "Action log read failed, retrying next tick");
                }
            }
        }
        batches
    }

    /// Fold previously read batches into the run state.
    pub fn apply(&mut self, state: &mut RunState, batches: Vec<(String, ReadBatch)>) -> IngestOutcome {
        let was_complete = state.all_started_platforms_completed();
        let mut outcome = IngestOutcome::default();

        for (platform, batch) in batches {
            outcome.malformed += batch.malformed.len();
            for record in batch.records {
                match record {
                    LogRecord::Event(event) => {
                        outcome.events += 1;
                        apply_event(state, &platform, event);
                    }
                    LogRecord::Action(action) => {
                        apply_action(state, &platform, &action);
                        outcome.actions.push(action);
                    }
                }
            }
        }

        if !outcome.is_empty() {
            state.touch();
        }

        if !was_complete && state.all_started_platforms_completed() {
            outcome.completed = true;
            if matches!(state.status, RunStatus::Running | RunStatus::Paused) {
                tracing::info!(run_id = %state.run_id, total_actions = state.total_actions(), "All platforms reported completion");
                state.finish(RunStatus::Completed, None);
            }
        }

        self.check_skew(state);
        outcome
    }

    /// Read and apply in one step.
    pub fn ingest(&mut self, state: &mut RunState) -> IngestOutcome {
        let batches = self.read_new();
        self.apply(state, batches)
    }

    fn check_skew(&mut self, state: &RunState) {
        let Some(tolerance) = self.skew_tolerance else {
            return;
        };
        let skew = state.round_skew();
        if skew > tolerance && !self.skew_warned {
            self.skew_warned = true;
            tracing::warn!(run_id = %state.run_id, skew, tolerance, "Platforms drifted apart in round progress");
        }
    }
}

fn apply_event(state: &mut RunState, platform: &str, event: LogEvent) {
    let minutes_per_round = state.minutes_per_round;
    match event {
        LogEvent::SimulationStart { total_rounds, .. } => {
            let progress = state.platform_mut(platform);
            progress.started = true;
            progress.running = true;
            if state.total_rounds == 0
                && let Some(total) = total_rounds
            {
                state.total_rounds = total;
            }
            tracing::debug!(run_id = %state.run_id, platform, "Platform started");
        }
        LogEvent::RoundStart {
            round,
            simulated_hour,
            timestamp,
        } => {
            mark_started(state, platform);
            let summary = state
                .rounds
                .entry(round)
                .or_insert_with(|| RoundSummary::new(round));
            if summary.start_time.is_none() {
                summary.start_time = timestamp;
            }
            summary.simulated_hour = simulated_hour;
        }
        LogEvent::RoundEnd {
            round,
            simulated_hours,
            timestamp,
            ..
        } => {
            let progress = state.platform_mut(platform);
            progress.started = true;
            progress.current_round = progress.current_round.max(round);
            let hours = simulated_hours
                .unwrap_or_else(|| f64::from(round) * f64::from(minutes_per_round) / 60.0);
            progress.simulated_hours = progress.simulated_hours.max(hours);

            state.current_round = state.current_round.max(round);
            state.simulated_hours = state.simulated_hours.max(hours);
            if let Some(summary) = state.rounds.get_mut(&round)
                && timestamp.is_some()
            {
                summary.end_time = timestamp;
            }
        }
        LogEvent::SimulationEnd {
            total_rounds,
            total_actions,
        } => {
            let progress = state.platform_mut(platform);
            progress.started = true;
            progress.completed = true;
            progress.running = false;
            progress.reported_total_rounds = total_rounds;
            progress.reported_total_actions = total_actions;
            let counted = progress.actions_count;
            if let Some(reported) = total_actions
                && reported != counted
            {
                tracing::warn!(run_id = %state.run_id, platform, reported, counted, "Terminal action total differs from ingested count");
            }
            tracing::info!(run_id = %state.run_id, platform, actions = counted, "Platform completed");
        }
        LogEvent::Other => {}
    }
}

fn mark_started(state: &mut RunState, platform: &str) {
    let progress = state.platform_mut(platform);
    if !progress.started {
        progress.started = true;
        progress.running = true;
    }
}

fn apply_action(state: &mut RunState, platform: &str, action: &AgentAction) {
    mark_started(state, platform);
    state.platform_mut(platform).actions_count += 1;
    state.current_round = state.current_round.max(action.round);
    state
        .rounds
        .entry(action.round)
        .or_insert_with(|| RoundSummary::new(action.round))
        .record(action);
    state.push_recent(action.clone());
}
