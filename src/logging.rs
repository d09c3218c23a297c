//! Structured logging for the node.
//!
//! Thin wrapper over `tracing-subscriber`: log level comes from `RUST_LOG`,
//! defaulting to `info` for the node's own crates.

use tracing_subscriber::EnvFilter;

/// Initialise the global subscriber. Safe to call once per process; tests
/// that need output call `try_init` and ignore the error.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,lighthouse=info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
