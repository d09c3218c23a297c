//! The engine's view of the Bitcoin network.
//!
//! [`BitcoinView`] is the only capability the engine depends on: UTXO
//! lookups fanned out to several peers, transaction broadcast with
//! propagation confirmation, and watch/tip notifications delivered onto the
//! engine's queue. [`PeerGroup`] implements it over plain Bitcoin p2p
//! connections; tests substitute scripted implementations.

pub mod error;
pub mod peer;
pub mod utxo;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::{BlockHash, Network, OutPoint, Transaction, Txid};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use error::NetworkError;
use peer::{spawn_peer, PeerHandle, PeerRequest, SharedPeerState};
use utxo::UtxoEntry;

/// Events pushed by the network layer onto the engine queue.
#[derive(Debug, Clone)]
pub enum ChainNotification {
    TipChanged { height: u64, hash: BlockHash },
    SpendSeen { outpoint: OutPoint, spending_tx: Txid },
    PeerSetChanged,
}

/// One peer's answer to a UTXO query.
#[derive(Debug, Clone)]
pub struct PeerUtxoAnswer {
    pub peer: String,
    pub chain_height: u32,
    /// Query outpoint -> `Some(utxo)` if unspent, `None` if spent/unknown.
    pub utxos: HashMap<OutPoint, Option<UtxoEntry>>,
}

/// What the engine needs from a peer group.
#[async_trait]
pub trait BitcoinView: Send + Sync + 'static {
    /// Ask up to the quorum size of peers about `outpoints`, concurrently.
    /// Returns one answer per peer that responded in time.
    async fn get_utxos(
        &self,
        outpoints: &[OutPoint],
        include_mempool: bool,
    ) -> Result<Vec<PeerUtxoAnswer>, NetworkError>;

    /// Broadcast `tx`, resolving once at least `min_propagation` peers have
    /// announced it back.
    async fn broadcast(
        &self,
        tx: Transaction,
        min_propagation: usize,
    ) -> Result<usize, NetworkError>;

    /// Start watching outpoints for spends; notifications arrive on the
    /// channel the view was built with.
    async fn watch_outpoints(&self, outpoints: Vec<OutPoint>);

    fn peer_count(&self) -> usize;
}

/// Knobs of the live peer group.
#[derive(Debug, Clone)]
pub struct PeerGroupConfig {
    pub connect: Vec<SocketAddr>,
    /// Peers asked per UTXO query. Defaults to 2; 1 is allowed off-mainnet.
    pub utxo_quorum: usize,
    pub peer_timeout: Duration,
    pub overall_timeout: Duration,
    pub broadcast_timeout: Duration,
}

impl Default for PeerGroupConfig {
    fn default() -> Self {
        Self {
            connect: Vec::new(),
            utxo_quorum: 2,
            peer_timeout: Duration::from_secs(15),
            overall_timeout: Duration::from_secs(60),
            broadcast_timeout: Duration::from_secs(120),
        }
    }
}

/// Context each peer task gets a clone of.
#[derive(Clone)]
pub struct PeerShared {
    pub network: Network,
    pub state: Arc<SharedPeerState>,
    pub notify_tx: mpsc::UnboundedSender<ChainNotification>,
}

/// A set of Bitcoin peers behind the [`BitcoinView`] capability.
pub struct PeerGroup {
    config: PeerGroupConfig,
    peers: RwLock<Vec<PeerHandle>>,
    shared: PeerShared,
}

impl PeerGroup {
    pub fn new(
        network: Network,
        config: PeerGroupConfig,
        notify_tx: mpsc::UnboundedSender<ChainNotification>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            peers: RwLock::new(Vec::new()),
            shared: PeerShared {
                network,
                state: Arc::new(SharedPeerState::default()),
                notify_tx,
            },
        })
    }

    /// Spawn the connection-maintenance loop: connect the configured peers
    /// and reconnect them when they drop.
    pub fn start(self: &Arc<Self>) {
        let group = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                group.maintain().await;
                tokio::time::sleep(Duration::from_secs(20)).await;
            }
        });
    }

    async fn maintain(&self) {
        let connected: Vec<SocketAddr> = {
            let mut peers = self.peers.write().expect("peer list lock");
            peers.retain(|p| p.is_alive());
            peers.iter().map(|p| p.addr).collect()
        };
        for addr in self.config.connect.clone() {
            if connected.contains(&addr) {
                continue;
            }
            match spawn_peer(addr, self.shared.clone()).await {
                Ok(handle) => {
                    info!(peer = %addr, "peer connected");
                    self.peers.write().expect("peer list lock").push(handle);
                    let _ = self.shared.notify_tx.send(ChainNotification::PeerSetChanged);
                }
                Err(e) => debug!(peer = %addr, error = %e, "connect failed"),
            }
        }
    }

    pub fn best_height(&self) -> u64 {
        self.shared.state.best_height.load(Ordering::SeqCst) as u64
    }
}

#[async_trait]
impl BitcoinView for PeerGroup {
    async fn get_utxos(
        &self,
        outpoints: &[OutPoint],
        include_mempool: bool,
    ) -> Result<Vec<PeerUtxoAnswer>, NetworkError> {
        type Reply = oneshot::Receiver<Result<utxo::UtxosReply, NetworkError>>;
        let targets: Vec<(SocketAddr, Reply)> = {
            let peers = self.peers.read().expect("peer list lock");
            let mut targets = Vec::new();
            for handle in peers.iter().filter(|p| p.is_alive()).take(self.config.utxo_quorum) {
                let (tx, rx) = oneshot::channel();
                let req = PeerRequest::GetUtxos {
                    outpoints: outpoints.to_vec(),
                    include_mempool,
                    reply: tx,
                };
                // try_send keeps the lock free of awaits.
                if handle.sender().try_send(req).is_ok() {
                    targets.push((handle.addr, rx));
                }
            }
            targets
        };
        if targets.is_empty() {
            return Err(NetworkError::Offline);
        }

        let peer_timeout = self.config.peer_timeout;
        let gather = futures::future::join_all(targets.into_iter().map(|(addr, rx)| async move {
            match tokio::time::timeout(peer_timeout, rx).await {
                Ok(Ok(Ok(reply))) => Some((addr, reply)),
                Ok(Ok(Err(e))) => {
                    warn!(peer = %addr, error = %e, "utxo query failed");
                    None
                }
                Ok(Err(_)) | Err(_) => {
                    warn!(peer = %addr, "utxo query timed out");
                    None
                }
            }
        }));
        let replies = tokio::time::timeout(self.config.overall_timeout, gather)
            .await
            .map_err(|_| NetworkError::Timeout)?;

        let answers: Vec<PeerUtxoAnswer> = replies
            .into_iter()
            .flatten()
            .map(|(addr, reply)| PeerUtxoAnswer {
                peer: addr.to_string(),
                chain_height: reply.chain_height,
                utxos: outpoints.iter().copied().zip(reply.entries).collect(),
            })
            .collect();
        if answers.is_empty() {
            return Err(NetworkError::Timeout);
        }
        Ok(answers)
    }

    async fn broadcast(
        &self,
        tx: Transaction,
        min_propagation: usize,
    ) -> Result<usize, NetworkError> {
        let txid = tx.compute_txid();
        self.shared
            .state
            .broadcasts
            .lock()
            .expect("broadcast lock")
            .insert(txid, Default::default());

        let sends: Vec<oneshot::Receiver<Result<(), NetworkError>>> = {
            let peers = self.peers.read().expect("peer list lock");
            peers
                .iter()
                .filter(|p| p.is_alive())
                .filter_map(|handle| {
                    let (reply, rx) = oneshot::channel();
                    handle
                        .sender()
                        .try_send(PeerRequest::Broadcast { tx: tx.clone(), reply })
                        .ok()
                        .map(|_| rx)
                })
                .collect()
        };
        if sends.is_empty() {
            return Err(NetworkError::Offline);
        }
        for rx in sends {
            let _ = rx.await;
        }

        let deadline = tokio::time::Instant::now() + self.config.broadcast_timeout;
        loop {
            let seen = self
                .shared
                .state
                .broadcasts
                .lock()
                .expect("broadcast lock")
                .get(&txid)
                .map(|s| s.len())
                .unwrap_or(0);
            if seen >= min_propagation {
                return Ok(seen);
            }
            let notified = self.shared.state.broadcast_seen.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(NetworkError::InsufficientPropagation(seen));
            }
        }
    }

    async fn watch_outpoints(&self, outpoints: Vec<OutPoint>) {
        let mut watched = self.shared.state.watched.lock().expect("watch lock");
        watched.extend(outpoints);
    }

    fn peer_count(&self) -> usize {
        self.peers.read().expect("peer list lock").iter().filter(|p| p.is_alive()).count()
    }
}
