//! Command/response channel between the supervisor and a running worker.
//!
//! [`CommandTransport`] is the seam: [`FileMailbox`] is the on-disk mailbox the
//! worker polls, [`ChannelTransport`] an in-memory equivalent for embedding and
//! tests. [`IpcClient`] layers the heartbeat check and error mapping on top.

mod channel;
mod mailbox;
mod protocol;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use channel::{ChannelServer, ChannelTransport, PendingCommand};
pub use mailbox::{
    COMMANDS_DIR, FileMailbox, HEARTBEAT_FILE, IpcServer, MailboxPaths, RESPONSES_DIR,
};
pub use protocol::{
    CommandStatus, CommandType, EnvStatus, Heartbeat, IpcCommand, IpcResponse,
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// No answer within the caller's deadline.
    #[error("command {command_id} timed out after {timeout:?}")]
    Timeout {
        command_id: String,
        timeout: Duration,
    },

    /// The worker answered with an error.
    #[error("command {command_id} failed: {error}")]
    Failed { command_id: String, error: String },

    #[error("simulation environment is not running")]
    EnvironmentNotAlive,

    #[error("transport closed")]
    Closed,

    #[error("malformed message: {0}")]
    Protocol(String),

    #[error("mailbox I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IpcError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Delivers one command and waits for its response.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn send(&self, command: IpcCommand, timeout: Duration) -> Result<IpcResponse, IpcError>;

    /// Latest heartbeat, if the worker has written one.
    fn heartbeat(&self) -> Option<Heartbeat>;
}

/// Out-of-band check that the worker process itself still exists.
pub type LivenessCheck = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Clone)]
pub struct IpcClient {
    transport: Arc<dyn CommandTransport>,
    liveness: Option<LivenessCheck>,
}

impl IpcClient {
    pub fn new(transport: Arc<dyn CommandTransport>) -> Self {
        Self {
            transport,
            liveness: None,
        }
    }

    /// Also require `check` to pass before sending. A worker killed without
    /// running its shutdown path leaves an `alive` heartbeat behind.
    pub fn with_liveness(mut self, check: LivenessCheck) -> Self {
        self.liveness = Some(check);
        self
    }

    pub fn heartbeat(&self) -> Option<Heartbeat> {
        self.transport.heartbeat()
    }

    pub fn is_alive(&self) -> bool {
        self.liveness.as_ref().is_none_or(|check| check())
            && self.heartbeat().is_some_and(|h| h.is_alive())
    }

    /// Send a command and return the raw response, whatever its status.
    pub async fn send_command(
        &self,
        command_type: CommandType,
        args: serde_json::Value,
        timeout: Duration,
    ) -> Result<IpcResponse, IpcError> {
        if !self.is_alive() {
            return Err(IpcError::EnvironmentNotAlive);
        }

        let command = IpcCommand::new(command_type, args);
        let command_id = command.command_id.clone();
        tracing::debug!(%command_id, command_type = command_type.as_str(), ?timeout, "Sending IPC command");

        let response = self.transport.send(command, timeout).await?;
        if response.command_id != command_id {
            return Err(IpcError::Protocol(format!(
                "response for {} answered command {command_id}",
                response.command_id
            )));
        }
        Ok(response)
    }

    /// Send a command and return its result, mapping `failed` to [`IpcError::Failed`].
    pub async fn request(
        &self,
        command_type: CommandType,
        args: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, IpcError> {
        let response = self.send_command(command_type, args, timeout).await?;
        match response.status {
            CommandStatus::Completed => Ok(response.result.unwrap_or(serde_json::Value::Null)),
            CommandStatus::Failed => Err(IpcError::Failed {
                command_id: response.command_id,
                error: response.error.unwrap_or_else(|| "unknown error".to_string()),
            }),
            status => Err(IpcError::Protocol(format!(
                "non-final status {status:?} for {}",
                response.command_id
            ))),
        }
    }
}
