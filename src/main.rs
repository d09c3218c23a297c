//! Node entrypoint: configuration, subsystem wiring, signal handling.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};

use lighthouse::api::{self, AppState};
use lighthouse::configuration::{load_configuration, Cli, Config};
use lighthouse::disk::DiskManager;
use lighthouse::engine::{
    forward_chain_notifications, forward_disk_events, Engine, EngineConfig, Event,
};
use lighthouse::handlers;
use lighthouse::logging;
use lighthouse::networking::{BitcoinView, PeerGroup, PeerGroupConfig};
use lighthouse::wallet::{KeyStoreWallet, WalletAdapter};

const LOCK_FILE: &str = ".lighthouse.lock";

/// Exclusive app-directory lock; released on drop.
struct AppLock {
    path: PathBuf,
}

impl AppLock {
    fn acquire(dir: &Path) -> std::io::Result<Self> {
        let path = dir.join(LOCK_FILE);
        std::fs::OpenOptions::new().write(true).create_new(true).open(&path)?;
        Ok(Self { path })
    }
}

impl Drop for AppLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init();

    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(1);
        }
    };
    if let Err(e) = std::fs::create_dir_all(&config.app_dir) {
        eprintln!("cannot create {}: {e}", config.app_dir.display());
        return ExitCode::from(1);
    }
    let _lock = match AppLock::acquire(&config.app_dir) {
        Ok(lock) => lock,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            eprintln!("another instance is already running in {}", config.app_dir.display());
            return ExitCode::from(2);
        }
        Err(e) => {
            eprintln!("cannot lock {}: {e}", config.app_dir.display());
            return ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("runtime start failed: {e}");
            return ExitCode::from(1);
        }
    };
    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("fatal: {e}");
            ExitCode::from(1)
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    info!(network = %config.network, dir = %config.app_dir.display(), "starting node");

    let disk = DiskManager::open(config.app_dir.clone()).await?;

    let (chain_tx, chain_rx) = mpsc::unbounded_channel();
    let group = PeerGroup::new(
        config.network,
        PeerGroupConfig {
            connect: config.connect.clone(),
            utxo_quorum: config.utxo_quorum,
            peer_timeout: Duration::from_secs(config.peer_timeout_secs),
            overall_timeout: Duration::from_secs(config.overall_timeout_secs),
            broadcast_timeout: Duration::from_secs(config.broadcast_timeout_secs),
        },
        chain_tx,
    );
    group.start();
    if config.connect.is_empty() {
        warn!("no peers configured; running offline, pledging disabled");
    }

    let wallet: Option<Arc<dyn WalletAdapter>> = match &config.keystore {
        Some(path) => {
            let wallet = KeyStoreWallet::load_or_generate(path.clone(), config.network)
                .await
                .map_err(|e| anyhow::anyhow!("keystore: {e}"))?;
            Some(Arc::new(wallet))
        }
        None => None,
    };

    let view: Arc<dyn BitcoinView> = group.clone();
    let (mut engine, handle) = Engine::new(
        view,
        wallet,
        disk.clone(),
        EngineConfig {
            min_propagation: config.min_propagation,
            utxo_quorum: config.utxo_quorum,
            fee_policy: config.fee_policy,
            offline: config.connect.is_empty(),
        },
    );
    let projects = engine.mirror();

    let (disk_tx, disk_rx) = mpsc::unbounded_channel();
    disk.start_watcher(disk_tx);
    let _disk_pump = forward_disk_events(handle.clone(), disk_rx);
    let _chain_pump = forward_chain_notifications(handle.clone(), chain_rx);

    if let Some(listen) = config.listen {
        let state = AppState::new(projects.clone(), handle.clone());
        tokio::spawn(async move {
            if let Err(e) = api::serve(listen, state).await {
                warn!(error = %e, "relay stopped");
            }
        });
    }
    let _status_poller = api::client::spawn_status_poller(handle.clone(), projects.clone());

    let engine_task = tokio::spawn(engine.run());

    handlers::shutdown_signal().await;
    handle.send(Event::Shutdown);
    let _ = engine_task.await;
    info!("node stopped");
    Ok(())
}
