//! Process supervisor - owns worker lifecycles for many runs.
//!
//! One instance per host, injected where needed:
//! - Lock-free run registry via DashMap (run_id -> handle)
//! - One monitor task per run, owning the worker process
//! - Stop/pause/resume through process-group signals
//! - Idempotent host-shutdown teardown

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::watch;

use crate::config::{LaunchSpec, SimulationConfig, SupervisorConfig};
use crate::forwarder::ActivityForwarder;
use crate::history::DATABASE_SUFFIX;
use crate::ingest::{ACTIONS_FILE, ActionIngestor};
use crate::interview::InterviewCoordinator;
use crate::ipc::{
    COMMANDS_DIR, FileMailbox, HEARTBEAT_FILE, IpcClient, LivenessCheck, RESPONSES_DIR,
};
use crate::monitor::{RunMonitor, SharedState, lock};
use crate::process::{
    CommandLauncher, GroupSignal, LaunchError, ProcessGroup, Termination, WORKER_LOG_FILE,
    WorkerExit, WorkerLauncher, WorkerSpawnConfig, pid_alive, terminate_group,
};
use crate::state::{RunState, RunStatus};
use crate::store::{RunStateStore, STATE_FILE, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("cannot start {run_id}: {reason}")]
    ConfigurationMissing { run_id: String, reason: String },

    #[error("invalid simulation config {path}: {reason}")]
    InvalidConfiguration { path: PathBuf, reason: String },

    #[error("run {0} is already running")]
    AlreadyRunning(String),

    #[error("run {0} not found")]
    NotFound(String),

    #[error("run {run_id} is {status}, not running")]
    NotRunning { run_id: String, status: RunStatus },

    #[error("failed to launch worker: {0}")]
    Launch(#[from] LaunchError),

    #[error("worker for {run_id} still alive {waited:?} after SIGKILL")]
    StopTimeout { run_id: String, waited: Duration },

    #[error("failed to signal worker for {run_id}: {source}")]
    Signal {
        run_id: String,
        #[source]
        source: io::Error,
    },

    #[error("supervisor is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Error recorded on every run torn down by [`ProcessSupervisor::shutdown_all`].
pub const HOST_SHUTDOWN: &str = "host shutdown";

/// Outcome of [`ProcessSupervisor::cleanup_logs`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub success: bool,
    /// Paths relative to the run directory.
    pub cleaned_files: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Clone)]
struct RunHandle {
    platforms: Vec<String>,
    group: ProcessGroup,
    state: SharedState,
    exit_rx: watch::Receiver<Option<WorkerExit>>,
    forwarder: Option<Arc<ActivityForwarder>>,
}

impl RunHandle {
    fn is_alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    fn snapshot(&self) -> RunState {
        lock(&self.state).clone()
    }
}

/// Releases a run id reserved by `start` once launch finishes either way.
struct StartReservation<'a> {
    starting: &'a DashMap<String, ()>,
    run_id: String,
}

impl Drop for StartReservation<'_> {
    fn drop(&mut self) {
        self.starting.remove(&self.run_id);
    }
}

pub struct ProcessSupervisor {
    config: SupervisorConfig,
    store: Arc<RunStateStore>,
    launcher: Arc<dyn WorkerLauncher>,
    runs: DashMap<String, RunHandle>,
    starting: DashMap<String, ()>,
    shutdown_done: AtomicBool,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Arc<Self> {
        Self::with_launcher(config, Arc::new(CommandLauncher))
    }

    pub fn with_launcher(config: SupervisorConfig, launcher: Arc<dyn WorkerLauncher>) -> Arc<Self> {
        let store = Arc::new(RunStateStore::new(config.runs_root.clone()));
        Arc::new(Self {
            config,
            store,
            launcher,
            runs: DashMap::new(),
            starting: DashMap::new(),
            shutdown_done: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<RunStateStore> {
        &self.store
    }

    fn handle(&self, run_id: &str) -> Option<RunHandle> {
        self.runs.get(run_id).map(|h| h.clone())
    }

    /// Launch the worker for `run_id`.
    ///
    /// The round budget comes from the run's simulation config, capped by
    /// `max_rounds` when positive.
    pub async fn start(
        &self,
        run_id: &str,
        spec: LaunchSpec,
        max_rounds: Option<u32>,
    ) -> Result<RunState, SupervisorError> {
        if self.shutdown_done.load(Ordering::Acquire) {
            return Err(SupervisorError::ShuttingDown);
        }
        if self.starting.insert(run_id.to_string(), ()).is_some() {
            return Err(SupervisorError::AlreadyRunning(run_id.to_string()));
        }
        let _reservation = StartReservation {
            starting: &self.starting,
            run_id: run_id.to_string(),
        };

        if self.handle(run_id).is_some_and(|h| h.is_alive()) {
            return Err(SupervisorError::AlreadyRunning(run_id.to_string()));
        }
        if let Ok(Some(previous)) = self.store.load(run_id)
            && previous.status.is_active()
            && previous.process_pid.is_some_and(pid_alive)
        {
            return Err(SupervisorError::AlreadyRunning(run_id.to_string()));
        }

        let run_dir = self.config.run_dir(run_id);
        let sim_config = self.check_launch_inputs(run_id, &run_dir, &spec)?;

        let mut state = RunState::new(run_id, &spec.platforms)
            .with_recent_capacity(self.config.recent_actions_capacity);
        state.total_rounds = sim_config.round_budget(max_rounds);
        state.total_simulation_hours = sim_config.time_config.total_simulation_hours;
        state.minutes_per_round = sim_config.time_config.minutes_per_round;
        state.started_at = Some(Utc::now());
        state.set_status(RunStatus::Starting);
        self.store.save(&state)?;

        let spawn_config = WorkerSpawnConfig::new(&spec, &run_dir, max_rounds);
        let worker = match self.launcher.launch(&spawn_config) {
            Ok(worker) => worker,
            Err(e) => {
                tracing::error!(run_id, error = %e, "Worker launch failed");
                state.finish(RunStatus::Failed, Some(format!("launch failed: {e}")));
                self.persist(&state);
                return Err(e.into());
            }
        };

        state.process_pid = Some(worker.pid);
        for progress in state.platforms.values_mut() {
            progress.running = true;
        }
        state.set_status(RunStatus::Running);
        self.persist(&state);

        let forwarder = spec.forwarder.clone().and_then(|config| {
            match ActivityForwarder::start(run_id, config) {
                Ok(forwarder) => Some(Arc::new(forwarder)),
                Err(e) => {
                    tracing::warn!(run_id, error = %e, "Activity forwarding disabled");
                    None
                }
            }
        });

        let shared: SharedState = Arc::new(Mutex::new(state.clone()));
        let (exit_tx, exit_rx) = watch::channel(None);
        let monitor = RunMonitor {
            run_id: run_id.to_string(),
            state: Arc::clone(&shared),
            store: Arc::clone(&self.store),
            ingestor: ActionIngestor::new(&run_dir, &spec.platforms)
                .with_skew_tolerance(self.config.round_skew_tolerance),
            exit_tx,
            forwarder: forwarder.clone(),
            poll_interval: self.config.poll_interval,
            log_path: spawn_config.log_path.clone(),
            excerpt_bytes: self.config.error_excerpt_bytes,
        };
        tokio::spawn(monitor.run(worker.child));

        self.runs.insert(
            run_id.to_string(),
            RunHandle {
                platforms: spec.platforms.clone(),
                group: ProcessGroup::from_pid(worker.pid),
                state: shared,
                exit_rx,
                forwarder,
            },
        );

        tracing::info!(
            run_id,
            pid = worker.pid,
            total_rounds = state.total_rounds,
            platforms = ?spec.platforms,
            "Run started"
        );
        Ok(state)
    }

    fn check_launch_inputs(
        &self,
        run_id: &str,
        run_dir: &Path,
        spec: &LaunchSpec,
    ) -> Result<SimulationConfig, SupervisorError> {
        let missing = |reason: String| SupervisorError::ConfigurationMissing {
            run_id: run_id.to_string(),
            reason,
        };

        if !run_dir.is_dir() {
            return Err(missing(format!("run directory {} does not exist", run_dir.display())));
        }
        if spec.platforms.is_empty() {
            return Err(missing("no platforms declared".to_string()));
        }
        if spec.program.components().count() > 1 && !spec.program.exists() {
            return Err(missing(format!("worker program {} not found", spec.program.display())));
        }

        let config_path = spec.config_path(run_dir);
        if !config_path.is_file() {
            return Err(missing(format!(
                "simulation config {} not found",
                config_path.display()
            )));
        }
        SimulationConfig::load(&config_path).map_err(|e| SupervisorError::InvalidConfiguration {
            path: config_path,
            reason: e.to_string(),
        })
    }

    /// Terminate the worker's whole process group and mark the run STOPPED.
    ///
    /// A run that already COMPLETED but whose worker still serves commands is
    /// terminated too and keeps its COMPLETED status. A stop that cannot
    /// signal the group, or whose worker outlives SIGKILL, leaves the run FAILED.
    pub async fn stop(&self, run_id: &str) -> Result<RunState, SupervisorError> {
        let handle = self.handle(run_id).ok_or_else(|| self.not_running(run_id))?;

        let previous = {
            let mut state = lock(&handle.state);
            let previous = state.status;
            let serving = previous == RunStatus::Completed && handle.is_alive();
            if !previous.is_active() && !serving {
                return Err(SupervisorError::NotRunning {
                    run_id: run_id.to_string(),
                    status: previous,
                });
            }
            state.set_status(RunStatus::Stopping);
            previous
        };
        self.persist(&handle.snapshot());
        tracing::info!(run_id, pgid = handle.group.id(), "Stopping run");

        let mut exit_rx = handle.exit_rx.clone();
        let termination = terminate_group(
            handle.group,
            &mut exit_rx,
            self.config.stop_grace,
            self.config.kill_wait,
        )
        .await;

        if let Some(forwarder) = &handle.forwarder {
            forwarder.stop().await;
        }

        let termination = match termination {
            Ok(termination) => termination,
            Err(source) => {
                let snapshot = {
                    let mut state = lock(&handle.state);
                    state.finish(RunStatus::Failed, Some(format!("failed to signal worker: {source}")));
                    state.clone()
                };
                self.persist(&snapshot);
                return Err(SupervisorError::Signal {
                    run_id: run_id.to_string(),
                    source,
                });
            }
        };

        if termination == Termination::TimedOut {
            let err = SupervisorError::StopTimeout {
                run_id: run_id.to_string(),
                waited: self.config.stop_grace + self.config.kill_wait,
            };
            // The monitor leaves failed runs alone once the exit arrives.
            let snapshot = {
                let mut state = lock(&handle.state);
                state.finish(RunStatus::Failed, Some(err.to_string()));
                state.clone()
            };
            self.persist(&snapshot);
            tracing::error!(run_id, status = %snapshot.status, "Worker did not exit after SIGKILL");
            return Err(err);
        }

        let snapshot = {
            let mut state = lock(&handle.state);
            if previous == RunStatus::Completed {
                state.set_status(RunStatus::Completed);
            } else {
                state.finish(RunStatus::Stopped, None);
            }
            state.clone()
        };
        self.persist(&snapshot);
        tracing::info!(run_id, ?termination, status = %snapshot.status, "Run stopped");
        Ok(snapshot)
    }

    fn not_running(&self, run_id: &str) -> SupervisorError {
        match self.store.get(run_id) {
            Ok(Some(state)) => SupervisorError::NotRunning {
                run_id: run_id.to_string(),
                status: state.status,
            },
            _ => SupervisorError::NotFound(run_id.to_string()),
        }
    }

    /// Suspend every process of a running worker.
    pub fn pause(&self, run_id: &str) -> Result<RunState, SupervisorError> {
        self.transition(run_id, RunStatus::Running, RunStatus::Paused, GroupSignal::Pause)
    }

    pub fn resume(&self, run_id: &str) -> Result<RunState, SupervisorError> {
        self.transition(run_id, RunStatus::Paused, RunStatus::Running, GroupSignal::Resume)
    }

    fn transition(
        &self,
        run_id: &str,
        from: RunStatus,
        to: RunStatus,
        signal: GroupSignal,
    ) -> Result<RunState, SupervisorError> {
        let handle = self.handle(run_id).ok_or_else(|| self.not_running(run_id))?;
        let snapshot = {
            let mut state = lock(&handle.state);
            if state.status != from || !handle.is_alive() {
                return Err(SupervisorError::NotRunning {
                    run_id: run_id.to_string(),
                    status: state.status,
                });
            }
            handle
                .group
                .signal(signal)
                .map_err(|source| SupervisorError::Signal {
                    run_id: run_id.to_string(),
                    source,
                })?;
            state.set_status(to);
            state.clone()
        };
        self.persist(&snapshot);
        tracing::info!(run_id, status = %to, "Run status changed");
        Ok(snapshot)
    }

    /// Current state: live view for supervised runs, otherwise the snapshot on disk.
    pub fn state(&self, run_id: &str) -> Result<Option<RunState>, StoreError> {
        match self.handle(run_id) {
            Some(handle) => Ok(Some(handle.snapshot())),
            None => self.store.get_fresh(run_id),
        }
    }

    /// Wait for the worker to exit and its final state to be recorded.
    pub async fn wait(&self, run_id: &str) -> Option<WorkerExit> {
        let mut exit_rx = self.handle(run_id)?.exit_rx;
        let exited = exit_rx
            .wait_for(|exit| exit.is_some())
            .await
            .map(|exit| *exit);
        match exited {
            Ok(exit) => exit,
            Err(_) => *exit_rx.borrow(),
        }
    }

    /// Runs whose worker process is still alive.
    pub fn active_runs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .runs
            .iter()
            .filter(|entry| entry.value().is_alive())
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Interview coordinator bound to the run's file mailbox.
    ///
    /// Requests fail fast once the worker process is gone, whatever its
    /// heartbeat file still says.
    pub fn interviews(&self, run_id: &str) -> Result<InterviewCoordinator, SupervisorError> {
        let run_dir = self.config.run_dir(run_id);
        let (platforms, liveness) = match self.handle(run_id) {
            Some(handle) => {
                let exit_rx = handle.exit_rx.clone();
                let liveness: LivenessCheck = Arc::new(move || exit_rx.borrow().is_none());
                (handle.platforms, liveness)
            }
            None => {
                let state = self
                    .store
                    .get(run_id)?
                    .ok_or_else(|| SupervisorError::NotFound(run_id.to_string()))?;
                let pid = state.process_pid;
                let liveness: LivenessCheck = Arc::new(move || pid.is_none_or(pid_alive));
                (state.platforms.into_keys().collect(), liveness)
            }
        };
        let client = IpcClient::new(Arc::new(FileMailbox::new(&run_dir))).with_liveness(liveness);
        Ok(InterviewCoordinator::new(client, platforms))
    }

    /// Delete run-scoped artifacts, keeping precomputed configuration and profiles.
    pub fn cleanup_logs(&self, run_id: &str) -> Result<CleanupReport, SupervisorError> {
        if self.handle(run_id).is_some_and(|h| h.is_alive()) {
            return Err(SupervisorError::AlreadyRunning(run_id.to_string()));
        }

        let run_dir = self.config.run_dir(run_id);
        let mut report = CleanupReport::default();
        if !run_dir.is_dir() {
            report.success = true;
            return Ok(report);
        }

        match self.store.remove(run_id) {
            Ok(true) => report.cleaned_files.push(STATE_FILE.to_string()),
            Ok(false) => {}
            Err(e) => report.errors.push(e.to_string()),
        }

        let mut targets: Vec<PathBuf> = [WORKER_LOG_FILE, "stdout.log", "stderr.log", HEARTBEAT_FILE]
            .iter()
            .map(|name| run_dir.join(name))
            .collect();
        match run_artifacts(&run_dir) {
            Ok(found) => targets.extend(found),
            Err(e) => report.errors.push(format!("{}: {e}", run_dir.display())),
        }

        for path in targets {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    let relative = path.strip_prefix(&run_dir).unwrap_or(&path);
                    report.cleaned_files.push(relative.display().to_string());
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => report.errors.push(format!("{}: {e}", path.display())),
            }
        }

        self.runs.remove(run_id);
        report.success = report.errors.is_empty();
        tracing::info!(run_id, cleaned = report.cleaned_files.len(), errors = report.errors.len(), "Cleaned run artifacts");
        Ok(report)
    }

    /// Terminate every worker still alive and mark those runs stopped. A
    /// completed run keeps its status and records the shutdown as its error.
    ///
    /// Runs once; later calls return 0 immediately. Each worker gets the
    /// shutdown grace period, then SIGKILL, all in parallel.
    pub async fn shutdown_all(&self) -> usize {
        if self
            .shutdown_done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return 0;
        }

        let handles: Vec<(String, RunHandle)> = self
            .runs
            .iter()
            .filter(|entry| entry.value().is_alive())
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        if handles.is_empty() {
            return 0;
        }
        tracing::info!(runs = handles.len(), "Terminating workers for host shutdown");

        let teardowns = handles.into_iter().map(|(run_id, handle)| async move {
            let (previous, snapshot) = {
                let mut state = lock(&handle.state);
                let previous = state.status;
                if previous.is_active() || previous == RunStatus::Completed {
                    state.set_status(RunStatus::Stopping);
                }
                (previous, state.clone())
            };
            self.persist(&snapshot);

            let mut exit_rx = handle.exit_rx.clone();
            let result = terminate_group(
                handle.group,
                &mut exit_rx,
                self.config.shutdown_grace,
                self.config.kill_wait,
            )
            .await;
            if let Err(e) = &result {
                tracing::warn!(run_id = %run_id, error = %e, "Failed to signal worker during shutdown");
            }
            if let Some(forwarder) = &handle.forwarder {
                forwarder.stop().await;
            }

            let snapshot = {
                let mut state = lock(&handle.state);
                if previous == RunStatus::Completed {
                    state.set_status(RunStatus::Completed);
                    state.error = Some(HOST_SHUTDOWN.to_string());
                } else if state.status.is_active() || state.status == RunStatus::Stopping {
                    state.finish(RunStatus::Stopped, Some(HOST_SHUTDOWN.to_string()));
                }
                state.clone()
            };
            self.persist(&snapshot);
        });
        let count = join_all(teardowns).await.len();
        tracing::info!(runs = count, "Host shutdown teardown complete");
        count
    }

    fn persist(&self, state: &RunState) {
        if let Err(e) = self.store.save(state) {
            tracing::warn!(run_id = %state.run_id, error = %e, "Failed to persist run state");
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if self.shutdown_done.load(Ordering::Acquire) {
            return;
        }
        for entry in self.runs.iter() {
            let handle = entry.value();
            if handle.is_alive() {
                tracing::warn!(run_id = %entry.key(), "Supervisor dropped with live worker, killing process group");
                let _ = handle.group.signal(GroupSignal::Kill);
            }
        }
    }
}

/// Action logs, worker databases and mailbox files inside a run directory.
fn run_artifacts(run_dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(run_dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let file_type = entry.file_type()?;

        if file_type.is_file() && name.ends_with(DATABASE_SUFFIX) {
            found.push(path);
        } else if file_type.is_dir() && (name == COMMANDS_DIR || name == RESPONSES_DIR) {
            for mail in std::fs::read_dir(&path)? {
                let mail = mail?;
                if mail.file_type()?.is_file() {
                    found.push(mail.path());
                }
            }
        } else if file_type.is_dir() && path.join(ACTIONS_FILE).is_file() {
            found.push(path.join(ACTIONS_FILE));
        }
    }
    found.sort();
    Ok(found)
}
