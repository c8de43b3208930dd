//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! The first signal cancels the run token: the current transfer is
//! abandoned, the manifest is checkpointed and the process exits normally.
//! A second signal exits immediately.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Exit status used when a second signal forces the process down
pub const FORCED_EXIT_CODE: i32 = 130;

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self { token: CancellationToken::new() }
    }

    /// Token cancelled when shutdown is requested
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for SIGTERM or SIGINT.
    ///
    /// Returns without waiting if the handlers cannot be installed.
    pub async fn wait_for_signal() {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), stopping after the current checkpoint...");
            }
            _ = terminate => {
                info!("Received SIGTERM, stopping after the current checkpoint...");
            }
        }
    }

    /// Listen for signals in the background until the process ends.
    pub fn spawn_listener(&self) -> tokio::task::JoinHandle<()> {
        let token = self.token.clone();
        tokio::spawn(async move {
            Self::wait_for_signal().await;
            token.cancel();

            Self::wait_for_signal().await;
            warn!("Second signal received, exiting immediately");
            std::process::exit(FORCED_EXIT_CODE);
        })
    }

    /// Request shutdown without a signal
    pub fn shutdown(&self) {
        info!("Graceful shutdown initiated");
        self.token.cancel();
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
