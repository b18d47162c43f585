//! File mailbox transport.
//!
//! Layout inside a run directory:
//! - `ipc_commands/{command_id}.json`: written by the client, deleted by the server
//! - `ipc_responses/{command_id}.json`: written by the server, deleted by the client
//! - `env_status.json`: heartbeat, rewritten by the server
//!
//! Each file has a single writer and a single deleter, so no locking is needed.
//! All writes go through a temp file and a rename; readers only look at `*.json`.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::protocol::{EnvStatus, Heartbeat, IpcCommand, IpcResponse};
use super::{CommandTransport, DEFAULT_POLL_INTERVAL, IpcError};
use crate::store::write_atomic;

pub const COMMANDS_DIR: &str = "ipc_commands";
pub const RESPONSES_DIR: &str = "ipc_responses";
pub const HEARTBEAT_FILE: &str = "env_status.json";

#[derive(Debug, Clone)]
pub struct MailboxPaths {
    pub commands_dir: PathBuf,
    pub responses_dir: PathBuf,
    pub heartbeat: PathBuf,
}

impl MailboxPaths {
    pub fn for_run(run_dir: &Path) -> Self {
        Self {
            commands_dir: run_dir.join(COMMANDS_DIR),
            responses_dir: run_dir.join(RESPONSES_DIR),
            heartbeat: run_dir.join(HEARTBEAT_FILE),
        }
    }

    pub fn ensure(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.commands_dir)?;
        std::fs::create_dir_all(&self.responses_dir)
    }

    pub fn command_path(&self, command_id: &str) -> PathBuf {
        self.commands_dir.join(format!("{command_id}.json"))
    }

    pub fn response_path(&self, command_id: &str) -> PathBuf {
        self.responses_dir.join(format!("{command_id}.json"))
    }

    pub fn read_heartbeat(&self) -> Option<Heartbeat> {
        match read_json(&self.heartbeat) {
            Ok(heartbeat) => heartbeat,
            Err(e) => {
                tracing::debug!(path = %self.heartbeat.display(), error = %e, "Heartbeat unreadable");
                None
            }
        }
    }
}

/// Client half of the file mailbox.
#[derive(Debug, Clone)]
pub struct FileMailbox {
    paths: MailboxPaths,
    poll_interval: Duration,
}

impl FileMailbox {
    pub fn new(run_dir: &Path) -> Self {
        Self {
            paths: MailboxPaths::for_run(run_dir),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn paths(&self) -> &MailboxPaths {
        &self.paths
    }
}

#[async_trait]
impl CommandTransport for FileMailbox {
    async fn send(&self, command: IpcCommand, timeout: Duration) -> Result<IpcResponse, IpcError> {
        self.paths.ensure()?;
        let command_id = command.command_id.clone();
        let command_path = self.paths.command_path(&command_id);
        let response_path = self.paths.response_path(&command_id);

        write_json(&command_path, &command)?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match read_json::<IpcResponse>(&response_path) {
                Ok(Some(response)) if !response.status.is_final() => {
                    tracing::trace!(%command_id, status = ?response.status, "IPC command in progress");
                }
                Ok(Some(response)) => {
                    remove_quietly(&response_path);
                    remove_quietly(&command_path);
                    tracing::debug!(%command_id, status = ?response.status, "Received IPC response");
                    return Ok(response);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(%command_id, error = %e, "IPC response not readable yet");
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }

        // Stale command must not run late; a response racing in is dropped too.
        remove_quietly(&command_path);
        remove_quietly(&response_path);
        tracing::warn!(%command_id, ?timeout, "IPC command timed out");
        Err(IpcError::Timeout {
            command_id,
            timeout,
        })
    }

    fn heartbeat(&self) -> Option<Heartbeat> {
        self.paths.read_heartbeat()
    }
}

/// Worker half of the file mailbox.
#[derive(Debug, Clone)]
pub struct IpcServer {
    paths: MailboxPaths,
    channels: Vec<String>,
}

impl IpcServer {
    pub fn new(run_dir: &Path, channels: Vec<String>) -> io::Result<Self> {
        let paths = MailboxPaths::for_run(run_dir);
        paths.ensure()?;
        Ok(Self { paths, channels })
    }

    pub fn paths(&self) -> &MailboxPaths {
        &self.paths
    }

    /// Publish an alive heartbeat.
    pub fn start(&self) -> io::Result<()> {
        self.write_heartbeat(EnvStatus::Alive)
    }

    /// Publish a stopped heartbeat.
    pub fn stop(&self) -> io::Result<()> {
        self.write_heartbeat(EnvStatus::Stopped)
    }

    fn write_heartbeat(&self, status: EnvStatus) -> io::Result<()> {
        write_json(&self.paths.heartbeat, &Heartbeat::new(status, &self.channels))
    }

    /// Oldest pending command by modification time. Unparseable files are skipped.
    pub fn poll_command(&self) -> io::Result<Option<IpcCommand>> {
        let mut pending: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(&self.paths.commands_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            pending.push((modified, path));
        }
        pending.sort();

        for (_, path) in pending {
            match read_json::<IpcCommand>(&path) {
                Ok(Some(command)) => return Ok(Some(command)),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable IPC command");
                }
            }
        }
        Ok(None)
    }

    /// Write the response, then delete the command.
    ///
    /// Returns `false` without writing when the client already abandoned the
    /// command (its file is gone), so no orphan response is left behind.
    pub fn respond(&self, response: &IpcResponse) -> io::Result<bool> {
        let command_path = self.paths.command_path(&response.command_id);
        if !command_path.exists() {
            tracing::warn!(command_id = %response.command_id, "Client gave up on command, discarding response");
            return Ok(false);
        }
        write_json(&self.paths.response_path(&response.command_id), response)?;
        remove_quietly(&command_path);
        Ok(true)
    }

    pub fn respond_success(&self, command_id: &str, result: serde_json::Value) -> io::Result<bool> {
        self.respond(&IpcResponse::completed(command_id, result))
    }

    pub fn respond_error(&self, command_id: &str, error: impl Into<String>) -> io::Result<bool> {
        self.respond(&IpcResponse::failed(command_id, error))
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    write_atomic(path, &bytes)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove mailbox file");
    }
}
