//! Process shutdown coordination.
//!
//! OS signals and internal callers both cancel the same token; the host
//! awaits it and then runs `Scheduler::shutdown` once.

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Shared shutdown trigger.
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a coordinator that has not been triggered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request shutdown. Repeated calls are no-ops.
    pub fn trigger(&self, reason: &str) {
        if !self.token.is_cancelled() {
            info!(reason, "Shutdown requested");
        }
        self.token.cancel();
    }

    /// Whether shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// A token that is cancelled when shutdown is requested.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait until shutdown is requested.
    pub async fn wait(&self) {
        self.token.cancelled().await;
    }

    /// Trigger shutdown on SIGTERM or SIGINT (Ctrl+C on non-unix).
    pub fn listen_for_signals(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                reason = wait_for_signal() => this.trigger(reason),
                _ = this.token.cancelled() => {}
            }
        });
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            return ctrl_c().await;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        reason = ctrl_c() => reason,
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    ctrl_c().await
}

async fn ctrl_c() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    "SIGINT"
}
