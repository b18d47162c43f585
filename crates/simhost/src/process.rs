//! Worker process launch and process-group signalling.
//!
//! Workers start in their own process group so that every descendant can be
//! signalled at once. Combined stdout and stderr go to a log file in the run
//! directory rather than a pipe, which would stall a chatty worker nobody drains.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::process::Child;
use tokio::sync::watch;

use crate::config::LaunchSpec;

pub const WORKER_LOG_FILE: &str = "simulation.log";

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to open worker log {path}: {source}")]
    Log {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("spawned worker reported no pid")]
    NoPid,
}

/// Everything needed to start one worker.
#[derive(Debug, Clone)]
pub struct WorkerSpawnConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub config_path: PathBuf,
    pub max_rounds: Option<u32>,
    pub run_dir: PathBuf,
    pub log_path: PathBuf,
    pub env: Vec<(String, String)>,
}

impl WorkerSpawnConfig {
    pub fn new(spec: &LaunchSpec, run_dir: &Path, max_rounds: Option<u32>) -> Self {
        Self {
            program: spec.program.clone(),
            args: spec.args.clone(),
            config_path: spec.config_path(run_dir),
            max_rounds: max_rounds.filter(|n| *n > 0),
            run_dir: run_dir.to_path_buf(),
            log_path: run_dir.join(WORKER_LOG_FILE),
            env: spec.env.clone(),
        }
    }

    /// Full argument list: extra args, then `--config`, then the optional round cap.
    pub fn command_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        args.push("--config".to_string());
        args.push(self.config_path.display().to_string());
        if let Some(max_rounds) = self.max_rounds {
            args.push("--max-rounds".to_string());
            args.push(max_rounds.to_string());
        }
        args
    }
}

pub struct SpawnedWorker {
    pub child: Child,
    pub pid: u32,
}

/// Seam for starting worker processes.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, config: &WorkerSpawnConfig) -> Result<SpawnedWorker, LaunchError>;
}

/// Launches the worker as a real OS process in a fresh process group.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandLauncher;

impl WorkerLauncher for CommandLauncher {
    fn launch(&self, config: &WorkerSpawnConfig) -> Result<SpawnedWorker, LaunchError> {
        let log_err = |source| LaunchError::Log {
            path: config.log_path.clone(),
            source,
        };
        let stdout = std::fs::File::create(&config.log_path).map_err(log_err)?;
        let stderr = stdout.try_clone().map_err(log_err)?;

        let mut command = std::process::Command::new(&config.program);
        command
            .args(config.command_args())
            .current_dir(&config.run_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .env("PYTHONUTF8", "1")
            .env("PYTHONIOENCODING", "utf-8");
        for (key, value) in &config.env {
            command.env(key, value);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let child = tokio::process::Command::from(command)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: config.program.display().to_string(),
                source,
            })?;
        let pid = child.id().ok_or(LaunchError::NoPid)?;

        tracing::info!(
            pid,
            program = %config.program.display(),
            run_dir = %config.run_dir.display(),
            "Worker launched"
        );
        Ok(SpawnedWorker { child, pid })
    }
}

/// How the worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl WorkerExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exit code {code}"),
            (None, Some(signal)) => format!("terminated by signal {signal}"),
            (None, None) => "unknown exit status".to_string(),
        }
    }
}

impl From<std::process::ExitStatus> for WorkerExit {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Last `max_bytes` of the worker log, cut at a line boundary when possible.
pub fn log_tail(path: &Path, max_bytes: usize) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    let start = bytes.len().saturating_sub(max_bytes);
    let text = String::from_utf8_lossy(&bytes[start..]);
    let text = match (start > 0, text.find('\n')) {
        (true, Some(idx)) if idx + 1 < text.len() => &text[idx + 1..],
        _ => &text[..],
    };
    let text = text.trim_end();
    (!text.is_empty()).then(|| text.to_string())
}

/// Whether a process with this pid still exists (zombies included).
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

/// Signals delivered to a worker's process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSignal {
    Terminate,
    Kill,
    Pause,
    Resume,
}

/// Handle to a worker's process group, resolved from the leader pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessGroup {
    pgid: i32,
}

impl ProcessGroup {
    #[cfg(unix)]
    pub fn from_pid(pid: u32) -> Self {
        use nix::unistd::{Pid, getpgid};
        let raw = pid as i32;
        // Leader already reaped: it was started with process_group(0), so pgid == pid.
        let pgid = getpgid(Some(Pid::from_raw(raw)))
            .map(|p| p.as_raw())
            .unwrap_or(raw);
        Self { pgid }
    }

    #[cfg(not(unix))]
    pub fn from_pid(pid: u32) -> Self {
        Self { pgid: pid as i32 }
    }

    pub fn id(&self) -> i32 {
        self.pgid
    }

    /// Send `signal` to every member. A group that no longer exists is not an error.
    #[cfg(unix)]
    pub fn signal(&self, signal: GroupSignal) -> std::io::Result<bool> {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        let sig = match signal {
            GroupSignal::Terminate => Signal::SIGTERM,
            GroupSignal::Kill => Signal::SIGKILL,
            GroupSignal::Pause => Signal::SIGSTOP,
            GroupSignal::Resume => Signal::SIGCONT,
        };
        match killpg(Pid::from_raw(self.pgid), sig) {
            Ok(()) => {
                tracing::debug!(pgid = self.pgid, signal = ?sig, "Signalled process group");
                Ok(true)
            }
            Err(Errno::ESRCH) => Ok(false),
            Err(e) => Err(std::io::Error::from(e)),
        }
    }

    #[cfg(not(unix))]
    pub fn signal(&self, _signal: GroupSignal) -> std::io::Result<bool> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "process groups require a unix host",
        ))
    }
}

/// Result of terminating a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Leader exited within the grace period after SIGTERM.
    Graceful,
    /// Leader needed SIGKILL.
    Killed,
    /// Leader was still alive after SIGKILL and the kill wait.
    TimedOut,
}

/// SIGTERM the group, wait up to `grace` for the leader to exit, then SIGKILL.
///
/// After the leader is gone the group is swept with SIGKILL so descendants that
/// ignored SIGTERM do not outlive it. `exited` is the monitor's exit channel.
pub async fn terminate_group(
    group: ProcessGroup,
    exited: &mut watch::Receiver<Option<WorkerExit>>,
    grace: Duration,
    kill_wait: Duration,
) -> std::io::Result<Termination> {
    if exited.borrow().is_some() {
        group.signal(GroupSignal::Kill)?;
        return Ok(Termination::Graceful);
    }

    group.signal(GroupSignal::Terminate)?;
    // A paused group only acts on SIGTERM once continued.
    group.signal(GroupSignal::Resume)?;

    if wait_exit(exited, grace).await {
        group.signal(GroupSignal::Kill)?;
        return Ok(Termination::Graceful);
    }

    tracing::warn!(pgid = group.id(), grace_secs = grace.as_secs_f64(), "Worker ignored SIGTERM, escalating to SIGKILL");
    group.signal(GroupSignal::Kill)?;
    if wait_exit(exited, kill_wait).await {
        Ok(Termination::Killed)
    } else {
        Ok(Termination::TimedOut)
    }
}

async fn wait_exit(exited: &mut watch::Receiver<Option<WorkerExit>>, limit: Duration) -> bool {
    match tokio::time::timeout(limit, exited.wait_for(|exit| exit.is_some())).await {
        Ok(Ok(_)) => true,
        // Sender dropped: the monitor is gone, so the leader was reaped.
        Ok(Err(_)) => true,
        Err(_) => false,
    }
}
