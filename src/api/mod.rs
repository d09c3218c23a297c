//! Pledge relay: the HTTP surface of the engine.
//!
//! Serves project statuses (scrubbed by default, full for holders of the
//! project auth key) and accepts pledge uploads. Handlers read a mirror of
//! engine state; uploads go through the engine queue and await the verdict.

pub mod client;
pub mod rest;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::routing::get;
use axum::Router;
use tracing::info;

use crate::engine::{EngineHandle, ProjectId, ProjectSnapshot};
use crate::mirror::Mirror;

/// Auth nonces are remembered this long; a replay inside the window is
/// rejected.
const NONCE_WINDOW: Duration = Duration::from_secs(120);
/// Hard cap on distinct nonces tracked at once.
const NONCE_CAPACITY: usize = 1024;

/// Replay/rate-limit window for auth-gated status requests.
#[derive(Default)]
pub struct NonceWindow {
    seen: HashMap<Vec<u8>, Instant>,
}

impl NonceWindow {
    /// Accept a fresh nonce, rejecting replays and overload.
    pub fn admit(&mut self, nonce: &[u8]) -> bool {
        let now = Instant::now();
        self.seen.retain(|_, at| now.duration_since(*at) < NONCE_WINDOW);
        if self.seen.len() >= NONCE_CAPACITY || self.seen.contains_key(nonce) {
            return false;
        }
        self.seen.insert(nonce.to_vec(), now);
        true
    }
}

/// Shared state behind every relay handler.
#[derive(Clone)]
pub struct AppState {
    pub projects: Mirror<ProjectId, ProjectSnapshot>,
    pub engine: EngineHandle,
    pub nonces: Arc<Mutex<NonceWindow>>,
}

impl AppState {
    pub fn new(projects: Mirror<ProjectId, ProjectSnapshot>, engine: EngineHandle) -> Self {
        Self { projects, engine, nonces: Arc::new(Mutex::new(NonceWindow::default())) }
    }
}

/// Build the relay router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/project/{id}", get(rest::get_project).post(rest::post_pledge))
        .with_state(state)
}

/// Bind and serve the relay until the process exits.
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "relay listening");
    axum::serve(listener, app).await?;
    Ok(())
}
