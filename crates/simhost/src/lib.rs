//! simhost: supervisor core for long-running simulation workers.
//!
//! The worker is an opaque OS process. The supervisor launches it in its own
//! process group, tails the per-platform action logs it appends, keeps a durable
//! run state snapshot, and talks to it through a file mailbox while it runs.

pub mod action;
pub mod config;
pub mod forwarder;
pub mod history;
pub mod ingest;
pub mod interview;
pub mod ipc;
mod monitor;
pub mod process;
pub mod shutdown;
pub mod state;
pub mod store;
mod supervisor;

/// Crate version from Cargo.toml.
pub const SIMHOST_VERSION: &str = env!("CARGO_PKG_VERSION");

pub use action::{AgentAction, LogEvent, LogRecord};
pub use config::{LaunchSpec, SimulationConfig, SupervisorConfig};
pub use forwarder::{ActivityForwarder, ForwarderConfig, ForwarderStats};
pub use history::{ActionFilter, InterviewRecord, RunHistory};
pub use ingest::ActionIngestor;
pub use interview::{BatchOutcome, CloseOutcome, InterviewCoordinator, InterviewRequest};
pub use ipc::{FileMailbox, IpcClient, IpcError, IpcServer};
pub use process::{CommandLauncher, WorkerExit, WorkerLauncher};
pub use shutdown::install_shutdown_hook;
pub use state::{PlatformProgress, RoundSummary, RunState, RunStatus};
pub use store::{RunStateStore, StoreError};
pub use supervisor::{CleanupReport, HOST_SHUTDOWN, ProcessSupervisor, SupervisorError};
