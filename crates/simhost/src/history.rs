//! Read-only queries over a run's action logs and worker databases.
//!
//! Unlike the ingestor these re-read whole files, so they also work for runs
//! that finished before the current process started.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, params};
use serde::Serialize;

use crate::action::{AgentAction, LogRecord};
use crate::ingest::{ACTIONS_FILE, action_log_path};

/// Suffix of the per-platform database a worker keeps in its run directory.
pub const DATABASE_SUFFIX: &str = "_simulation.db";

pub fn database_path(run_dir: &Path, platform: &str) -> PathBuf {
    run_dir.join(format!("{platform}{DATABASE_SUFFIX}"))
}

#[derive(Debug, Clone, Default)]
pub struct ActionFilter {
    pub platform: Option<String>,
    pub agent_id: Option<u64>,
    pub round: Option<u32>,
}

impl ActionFilter {
    fn matches(&self, action: &AgentAction) -> bool {
        self.platform.as_ref().is_none_or(|p| *p == action.platform)
            && self.agent_id.is_none_or(|id| id == action.agent_id)
            && self.round.is_none_or(|r| r == action.round)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionPage {
    pub total: usize,
    pub offset: usize,
    pub actions: Vec<AgentAction>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RoundTimeline {
    pub round_num: u32,
    pub platform_actions: BTreeMap<String, u64>,
    pub total_actions: u64,
    pub active_agents: usize,
    pub action_types: BTreeMap<String, u64>,
    pub first_action_time: Option<String>,
    pub last_action_time: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AgentStats {
    pub agent_id: u64,
    pub agent_name: String,
    pub total_actions: u64,
    pub platform_actions: BTreeMap<String, u64>,
    pub action_types: BTreeMap<String, u64>,
    pub first_action_time: Option<String>,
    pub last_action_time: Option<String>,
}

/// One answered interview as recorded in a worker database.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InterviewRecord {
    pub agent_id: u64,
    pub platform: String,
    pub prompt: String,
    pub response: serde_json::Value,
    pub timestamp: String,
}

pub struct RunHistory {
    run_dir: PathBuf,
    platforms: Vec<String>,
}

impl RunHistory {
    pub fn new(run_dir: impl Into<PathBuf>, platforms: Vec<String>) -> Self {
        Self {
            run_dir: run_dir.into(),
            platforms,
        }
    }

    /// Use every subdirectory holding an action log, and every worker
    /// database, as a platform.
    pub fn discover(run_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let run_dir = run_dir.into();
        let mut platforms = BTreeSet::new();
        for entry in std::fs::read_dir(&run_dir)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if entry.path().join(ACTIONS_FILE).is_file() {
                platforms.insert(name);
            } else if let Some(platform) = name.strip_suffix(DATABASE_SUFFIX)
                && !platform.is_empty()
            {
                platforms.insert(platform.to_string());
            }
        }
        Ok(Self::new(run_dir, platforms.into_iter().collect()))
    }

    pub fn platforms(&self) -> &[String] {
        &self.platforms
    }

    /// Matching actions, newest first.
    pub fn actions(&self, filter: &ActionFilter) -> io::Result<Vec<AgentAction>> {
        let mut actions = Vec::new();
        for platform in &self.platforms {
            if filter.platform.as_ref().is_some_and(|p| p != platform) {
                continue;
            }
            read_actions(&action_log_path(&self.run_dir, platform), platform, &mut actions)?;
        }
        actions.retain(|a| filter.matches(a));
        actions.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(actions)
    }

    pub fn page(&self, filter: &ActionFilter, offset: usize, limit: usize) -> io::Result<ActionPage> {
        let actions = self.actions(filter)?;
        let total = actions.len();
        Ok(ActionPage {
            total,
            offset,
            actions: actions.into_iter().skip(offset).take(limit).collect(),
        })
    }

    /// Per-round aggregates in round order, optionally bounded (inclusive).
    pub fn timeline(&self, start_round: u32, end_round: Option<u32>) -> io::Result<Vec<RoundTimeline>> {
        let mut rounds: BTreeMap<u32, (RoundTimeline, BTreeSet<u64>)> = BTreeMap::new();
        for action in self.actions(&ActionFilter::default())?.into_iter().rev() {
            if action.round < start_round || end_round.is_some_and(|end| action.round > end) {
                continue;
            }
            let (round, agents) = rounds.entry(action.round).or_insert_with(|| {
                (
                    RoundTimeline {
                        round_num: action.round,
                        ..Default::default()
                    },
                    BTreeSet::new(),
                )
            });
            *round.platform_actions.entry(action.platform.clone()).or_insert(0) += 1;
            *round.action_types.entry(action.action_type.clone()).or_insert(0) += 1;
            round.total_actions += 1;
            agents.insert(action.agent_id);
            track_span(&mut round.first_action_time, &mut round.last_action_time, &action.timestamp);
        }

        Ok(rounds
            .into_values()
            .map(|(mut round, agents)| {
                round.active_agents = agents.len();
                round
            })
            .collect())
    }

    /// Per-agent aggregates, most active first.
    pub fn agent_stats(&self) -> io::Result<Vec<AgentStats>> {
        let mut agents: BTreeMap<u64, AgentStats> = BTreeMap::new();
        for action in self.actions(&ActionFilter::default())?.into_iter().rev() {
            let stats = agents.entry(action.agent_id).or_insert_with(|| AgentStats {
                agent_id: action.agent_id,
                agent_name: action.agent_name.clone(),
                ..Default::default()
            });
            stats.total_actions += 1;
            *stats.platform_actions.entry(action.platform.clone()).or_insert(0) += 1;
            *stats.action_types.entry(action.action_type.clone()).or_insert(0) += 1;
            track_span(&mut stats.first_action_time, &mut stats.last_action_time, &action.timestamp);
        }

        let mut stats: Vec<AgentStats> = agents.into_values().collect();
        stats.sort_by(|a, b| b.total_actions.cmp(&a.total_actions).then(a.agent_id.cmp(&b.agent_id)));
        Ok(stats)
    }

    /// Recorded interviews, newest first.
    ///
    /// `limit` applies per platform database and again to the merged list.
    /// A missing or unreadable database contributes nothing.
    pub fn interviews(
        &self,
        platform: Option<&str>,
        agent_id: Option<u64>,
        limit: usize,
    ) -> Vec<InterviewRecord> {
        let platforms: Vec<&str> = match platform {
            Some(platform) => vec![platform],
            None => self.platforms.iter().map(String::as_str).collect(),
        };

        let mut records = Vec::new();
        for platform in &platforms {
            let path = database_path(&self.run_dir, platform);
            if !path.is_file() {
                continue;
            }
            match read_interviews(&path, platform, agent_id, limit) {
                Ok(found) => records.extend(found),
                Err(e) => {
                    tracing::warn!(platform, path = %path.display(), error = %e, "Failed to read interview history");
                }
            }
        }
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        records.truncate(limit);
        records
    }
}

fn track_span(first: &mut Option<String>, last: &mut Option<String>, timestamp: &str) {
    if timestamp.is_empty() {
        return;
    }
    if first.as_deref().is_none_or(|f| timestamp < f) {
        *first = Some(timestamp.to_string());
    }
    if last.as_deref().is_none_or(|l| timestamp > l) {
        *last = Some(timestamp.to_string());
    }
}

fn read_actions(path: &Path, platform: &str, out: &mut Vec<AgentAction>) -> io::Result<()> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for raw in bytes.split(|b| *b == b'\n') {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Ok(LogRecord::Action(action)) = LogRecord::parse(line, platform) {
            out.push(action);
        }
    }
    Ok(())
}

fn read_interviews(
    path: &Path,
    platform: &str,
    agent_id: Option<u64>,
    limit: usize,
) -> rusqlite::Result<Vec<InterviewRecord>> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    let mut stmt = conn.prepare(
        r#"
        SELECT user_id, info, created_at
        FROM trace
        WHERE action = 'interview' AND (?1 IS NULL OR user_id = ?1)
        ORDER BY created_at DESC
        LIMIT ?2
        "#,
    )?;
    let agent_id = agent_id.and_then(|id| i64::try_from(id).ok());
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows = stmt.query_map(params![agent_id, limit], |row| {
        let user_id: i64 = row.get(0)?;
        let info = sql_text(row.get_ref(1)?);
        let timestamp = sql_text(row.get_ref(2)?).unwrap_or_default();
        Ok((user_id, info, timestamp))
    })?;

    let mut records = Vec::new();
    for row in rows {
        let (user_id, info, timestamp) = row?;
        let info = match info.as_deref().map(str::trim) {
            None | Some("") => serde_json::Value::Object(serde_json::Map::new()),
            Some(text) => serde_json::from_str(text)
                .unwrap_or_else(|_| serde_json::json!({ "raw": text })),
        };
        records.push(InterviewRecord {
            agent_id: u64::try_from(user_id).unwrap_or_default(),
            platform: platform.to_string(),
            prompt: info
                .get("prompt")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string(),
            response: info.get("response").cloned().unwrap_or_else(|| info.clone()),
            timestamp,
        });
    }
    Ok(records)
}

/// Column as text, whatever affinity the worker stored it with.
fn sql_text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}
