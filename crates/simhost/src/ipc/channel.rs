//! In-memory transport: commands travel over a tokio channel, each carrying a
//! oneshot for its response. Useful when the worker side lives in-process.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::protocol::{EnvStatus, Heartbeat, IpcCommand, IpcResponse};
use super::{CommandTransport, IpcError};

type SharedHeartbeat = Arc<Mutex<Option<Heartbeat>>>;

/// A command waiting for the server's answer.
pub struct PendingCommand {
    pub command: IpcCommand,
    reply: oneshot::Sender<IpcResponse>,
}

impl PendingCommand {
    /// The client stopped waiting (timed out or dropped).
    pub fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }

    /// Deliver the response. Returns `false` if the client is gone.
    pub fn respond(self, response: IpcResponse) -> bool {
        self.reply.send(response).is_ok()
    }
}

#[derive(Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<PendingCommand>,
    heartbeat: SharedHeartbeat,
}

pub struct ChannelServer {
    rx: mpsc::UnboundedReceiver<PendingCommand>,
    heartbeat: SharedHeartbeat,
    channels: Vec<String>,
}

impl ChannelTransport {
    pub fn pair(channels: Vec<String>) -> (Self, ChannelServer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let heartbeat: SharedHeartbeat = Arc::new(Mutex::new(None));
        (
            Self {
                tx,
                heartbeat: Arc::clone(&heartbeat),
            },
            ChannelServer {
                rx,
                heartbeat,
                channels,
            },
        )
    }
}

#[async_trait]
impl CommandTransport for ChannelTransport {
    async fn send(&self, command: IpcCommand, timeout: Duration) -> Result<IpcResponse, IpcError> {
        let command_id = command.command_id.clone();
        let (reply, response) = oneshot::channel();
        self.tx
            .send(PendingCommand { command, reply })
            .map_err(|_| IpcError::Closed)?;

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(IpcError::Closed),
            Err(_) => Err(IpcError::Timeout {
                command_id,
                timeout,
            }),
        }
    }

    fn heartbeat(&self) -> Option<Heartbeat> {
        self.heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ChannelServer {
    pub fn start(&self) {
        self.set_status(EnvStatus::Alive);
    }

    pub fn stop(&self) {
        self.set_status(EnvStatus::Stopped);
    }

    fn set_status(&self, status: EnvStatus) {
        *self.heartbeat.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Heartbeat::new(status, &self.channels));
    }

    /// Next live command; commands whose client already gave up are dropped.
    pub async fn recv(&mut self) -> Option<PendingCommand> {
        while let Some(pending) = self.rx.recv().await {
            if pending.is_abandoned() {
                tracing::debug!(command_id = %pending.command.command_id, "Dropping abandoned command");
                continue;
            }
            return Some(pending);
        }
        None
    }
}
