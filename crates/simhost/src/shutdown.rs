//! Host shutdown hook.
//!
//! Waits for SIGINT or SIGTERM and then tears down every worker the supervisor
//! still owns. The teardown itself is idempotent, so the hook can race with an
//! explicit `shutdown_all` call from the host.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::supervisor::ProcessSupervisor;

/// Resolves on the first SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, stopping workers...");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping workers...");
        }
    }
}

/// Spawn a task that runs [`ProcessSupervisor::shutdown_all`] on the first
/// termination signal. The task finishes once teardown is done.
pub fn install_shutdown_hook(supervisor: Arc<ProcessSupervisor>) -> JoinHandle<()> {
    tokio::spawn(async move {
        shutdown_signal().await;
        let stopped = supervisor.shutdown_all().await;
        info!(stopped, "Host shutdown cleanup finished");
    })
}
