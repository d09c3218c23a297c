//! Graceful shutdown handling.
//!
//! Listens for SIGINT (Ctrl+C) and SIGTERM and resolves once either
//! arrives, so the caller can drain the engine and exit cleanly.

use tracing::info;

pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::warn!(error = %e, "sigterm handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupt received"),
            _ = sigterm.recv() => info!("terminate received"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupt received");
    }
}
