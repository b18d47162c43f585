//! Durable run state snapshots.
//!
//! One writer (the supervisor), any number of readers. Writes go to a temp
//! file in the run directory and are renamed into place, so readers see
//! either the previous or the next snapshot. A reader that still hits a
//! half-written file gets [`StoreError::Incomplete`] and should retry.

use std::io;
use std::path::{Path, PathBuf};

use dashmap::DashMap;

use crate::state::RunState;

pub const STATE_FILE: &str = "run_state.json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("run state snapshot for {run_id} is incomplete, retry later: {source}")]
    Incomplete {
        run_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize run state: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    /// Whether a later read may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Incomplete { .. })
    }

    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub struct RunStateStore {
    root: PathBuf,
    cache: DashMap<String, RunState>,
}

impl RunStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join(run_id)
    }

    pub fn state_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join(STATE_FILE)
    }

    /// Persist a snapshot and refresh the cache.
    pub fn save(&self, state: &RunState) -> Result<(), StoreError> {
        let path = self.state_path(&state.run_id);
        let json = serde_json::to_vec_pretty(state)?;
        write_atomic(&path, &json).map_err(|e| StoreError::io(&path, e))?;
        self.cache.insert(state.run_id.clone(), state.clone());
        tracing::trace!(run_id = %state.run_id, status = %state.status, "Persisted run state");
        Ok(())
    }

    /// Read the snapshot from disk, bypassing the cache.
    pub fn load(&self, run_id: &str) -> Result<Option<RunState>, StoreError> {
        let path = self.state_path(run_id);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&path, e)),
        };

        let state: RunState =
            serde_json::from_slice(&bytes).map_err(|source| StoreError::Incomplete {
                run_id: run_id.to_string(),
                source,
            })?;
        self.cache.insert(run_id.to_string(), state.clone());
        Ok(Some(state))
    }

    /// Cached snapshot when present, otherwise disk.
    ///
    /// A transiently unreadable file falls back to the last cached copy.
    pub fn get(&self, run_id: &str) -> Result<Option<RunState>, StoreError> {
        if let Some(state) = self.cache.get(run_id) {
            return Ok(Some(state.clone()));
        }
        self.load(run_id)
    }

    /// Disk first, falling back to the cache only on a transient read.
    pub fn get_fresh(&self, run_id: &str) -> Result<Option<RunState>, StoreError> {
        match self.load(run_id) {
            Err(e) if e.is_transient() => match self.cache.get(run_id) {
                Some(state) => Ok(Some(state.clone())),
                None => Err(e),
            },
            other => other,
        }
    }

    /// Drop the snapshot from disk and cache. Returns whether a file was removed.
    pub fn remove(&self, run_id: &str) -> Result<bool, StoreError> {
        self.cache.remove(run_id);
        let path = self.state_path(run_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    /// Run ids with a snapshot on disk.
    pub fn list(&self) -> io::Result<Vec<String>> {
        let mut ids = Vec::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            if entry.path().join(STATE_FILE).is_file()
                && let Some(name) = entry.file_name().to_str()
            {
                ids.push(name.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Write via a sibling temp file and rename, creating parent directories.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("snapshot");
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()));
    std::fs::write(&tmp, bytes)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RunStatus;

    #[test]
    fn save_then_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStateStore::new(dir.path());
        let mut state = RunState::new("sim_1", &["twitter".to_string()]);
        state.set_status(RunStatus::Running);
        state.total_rounds = 144;
        store.save(&state).unwrap();

        let fresh = RunStateStore::new(dir.path());
        let loaded = fresh.load("sim_1").unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Running);
        assert_eq!(loaded.total_rounds, 144);
        assert_eq!(fresh.list().unwrap(), vec!["sim_1".to_string()]);
    }

    #[test]
    fn missing_snapshot_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStateStore::new(dir.path());
        assert!(store.load("nope").unwrap().is_none());
        assert!(store.get("nope").unwrap().is_none());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn truncated_snapshot_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStateStore::new(dir.path());
        let state = RunState::new("sim_1", &[]);
        store.save(&state).unwrap();

        let path = store.state_path("sim_1");
        let full = std::fs::read(&path).unwrap();
        std::fs::write(&path, &full[..full.len() / 2]).unwrap();

        let err = RunStateStore::new(dir.path()).load("sim_1").unwrap_err();
        assert!(err.is_transient());

        // The writer's own store still answers from its cache.
        let cached = store.get_fresh("sim_1").unwrap().unwrap();
        assert_eq!(cached.run_id, "sim_1");
    }

    #[test]
    fn no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStateStore::new(dir.path());
        for _ in 0..3 {
            store.save(&RunState::new("sim_1", &[])).unwrap();
        }
        let names: Vec<String> = std::fs::read_dir(store.run_dir("sim_1"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![STATE_FILE.to_string()]);
    }

    #[test]
    fn remove_clears_disk_and_cache() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStateStore::new(dir.path());
        store.save(&RunState::new("sim_1", &[])).unwrap();
        assert!(store.remove("sim_1").unwrap());
        assert!(!store.remove("sim_1").unwrap());
        assert!(store.get("sim_1").unwrap().is_none());
    }
}
