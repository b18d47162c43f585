//! Per-run monitor task.
//!
//! Owns the worker's `Child`. Ticks until the process exits, folding new log
//! lines into the shared run state and persisting it; then does one last read,
//! classifies the exit and publishes it on the exit channel.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::watch;

use crate::forwarder::ActivityForwarder;
use crate::ingest::ActionIngestor;
use crate::process::{WorkerExit, log_tail};
use crate::state::{RunState, RunStatus};
use crate::store::RunStateStore;

pub(crate) type SharedState = Arc<Mutex<RunState>>;

pub(crate) fn lock(state: &SharedState) -> std::sync::MutexGuard<'_, RunState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct RunMonitor {
    pub run_id: String,
    pub state: SharedState,
    pub store: Arc<RunStateStore>,
    pub ingestor: ActionIngestor,
    pub exit_tx: watch::Sender<Option<WorkerExit>>,
    pub forwarder: Option<Arc<ActivityForwarder>>,
    pub poll_interval: Duration,
    pub log_path: PathBuf,
    pub excerpt_bytes: usize,
}

impl RunMonitor {
    pub async fn run(mut self, mut child: Child) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let status = loop {
            tokio::select! {
                biased;
                status = child.wait() => break status,
                _ = ticker.tick() => self.tick(),
            }
        };

        let exit = match status {
            Ok(status) => WorkerExit::from(status),
            Err(e) => {
                tracing::error!(run_id = %self.run_id, error = %e, "Failed to collect worker exit status");
                WorkerExit {
                    code: None,
                    signal: None,
                }
            }
        };
        tracing::info!(run_id = %self.run_id, exit = %exit.describe(), "Worker exited");

        // Output may have been flushed after the last tick.
        self.tick();
        self.classify(exit);

        let _ = self.exit_tx.send(Some(exit));

        if let Some(forwarder) = &self.forwarder {
            forwarder.stop().await;
        }
    }

    fn tick(&mut self) {
        let batches = self.ingestor.read_new();
        let (snapshot, outcome) = {
            let mut state = lock(&self.state);
            let outcome = self.ingestor.apply(&mut state, batches);
            (state.clone(), outcome)
        };

        if outcome.malformed > 0 {
            tracing::debug!(run_id = %self.run_id, malformed = outcome.malformed, "Skipped malformed log lines");
        }
        self.persist(&snapshot);

        if let Some(forwarder) = &self.forwarder {
            for action in &outcome.actions {
                forwarder.push(action);
            }
        }
    }

    fn classify(&self, exit: WorkerExit) {
        let snapshot = {
            let mut state = lock(&self.state);
            match state.status {
                // stop() owns the final transition; a failed stop already settled it.
                RunStatus::Stopping | RunStatus::Stopped | RunStatus::Failed => return,
                RunStatus::Completed if exit.success() => {}
                _ if exit.success() && state.all_started_platforms_completed() => {
                    state.finish(RunStatus::Completed, None);
                    tracing::info!(run_id = %self.run_id, total_actions = state.total_actions(), "Run completed");
                }
                _ => {
                    let reason = if exit.success() {
                        let missing = state.incomplete_platforms();
                        if missing.is_empty() {
                            "worker exited before any platform reported completion".to_string()
                        } else {
                            format!(
                                "worker exited before platforms reported completion: {}",
                                missing.join(", ")
                            )
                        }
                    } else {
                        format!("worker failed with {}", exit.describe())
                    };
                    let error = match log_tail(&self.log_path, self.excerpt_bytes) {
                        Some(tail) => format!("{reason}\n{tail}"),
                        None => reason,
                    };
                    tracing::error!(run_id = %self.run_id, exit = %exit.describe(), "Run failed");
                    state.finish(RunStatus::Failed, Some(error));
                }
            }
            state.clone()
        };
        self.persist(&snapshot);
    }

    fn persist(&self, state: &RunState) {
        if let Err(e) = self.store.save(state) {
            tracing::warn!(run_id = %self.run_id, error = %e, "Failed to persist run state");
        }
    }
}
