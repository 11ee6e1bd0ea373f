//! Shutdown signals for the binary and the maintenance task

use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

/// Resolve on SIGTERM, SIGINT or Ctrl+C. Falls back to Ctrl+C alone when a
/// unix handler cannot be installed.
pub async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let handlers = signal(SignalKind::terminate())
            .and_then(|term| signal(SignalKind::interrupt()).map(|int| (term, int)));
        let (mut sigterm, mut sigint) = match handlers {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Unix signal handlers unavailable ({}), waiting for Ctrl+C", e);
                signal::ctrl_c().await.ok();
                return;
            }
        };

        let name = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
            _ = signal::ctrl_c() => "Ctrl+C",
        };
        info!("Received {}, stopping connection manager", name);
    }

    #[cfg(not(unix))]
    {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, stopping connection manager"),
            Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
        }
    }
}

/// Watch channel that flips to `true` once the node should stop
pub fn create_shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}
