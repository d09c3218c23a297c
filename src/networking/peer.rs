//! A single Bitcoin peer connection.
//!
//! Each peer runs as its own tokio task: it performs the version handshake,
//! answers pings, relays the requests handed to it by the peer group and
//! pushes tip changes and watched-outpoint spends onto the group's
//! notification channel. One UTXO query is in flight per peer at a time; the
//! group serializes requests through the peer's command channel.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use bitcoin::consensus::encode;
use bitcoin::p2p::message::{NetworkMessage, RawNetworkMessage};
use bitcoin::p2p::message_blockdata::Inventory;
use bitcoin::p2p::message_network::VersionMessage;
use bitcoin::p2p::{address, Magic, ServiceFlags};
use bitcoin::{OutPoint, Transaction, Txid};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::error::NetworkError;
use super::utxo::{self, UtxosReply};
use super::{ChainNotification, PeerShared};

const PROTOCOL_VERSION: u32 = 70015;
const USER_AGENT: &str = "/lighthouse:0.1.0/";
const READ_CHUNK: usize = 64 * 1024;

/// Work the group hands to a peer task.
pub enum PeerRequest {
    GetUtxos {
        outpoints: Vec<OutPoint>,
        include_mempool: bool,
        reply: oneshot::Sender<Result<UtxosReply, NetworkError>>,
    },
    Broadcast {
        tx: Transaction,
        reply: oneshot::Sender<Result<(), NetworkError>>,
    },
}

/// Group-side handle to a running peer task.
pub struct PeerHandle {
    pub addr: SocketAddr,
    req_tx: mpsc::Sender<PeerRequest>,
}

impl PeerHandle {
    pub fn is_alive(&self) -> bool {
        !self.req_tx.is_closed()
    }

    pub fn sender(&self) -> &mpsc::Sender<PeerRequest> {
        &self.req_tx
    }
}

/// State shared between the peers of one group.
pub struct SharedPeerState {
    pub watched: Mutex<HashSet<OutPoint>>,
    pub broadcasts: Mutex<HashMap<Txid, HashSet<SocketAddr>>>,
    pub broadcast_seen: tokio::sync::Notify,
    pub best_height: AtomicU32,
}

impl Default for SharedPeerState {
    fn default() -> Self {
        Self {
            watched: Mutex::new(HashSet::new()),
            broadcasts: Mutex::new(HashMap::new()),
            broadcast_seen: tokio::sync::Notify::new(),
            best_height: AtomicU32::new(0),
        }
    }
}

/// Connect and spawn a peer task; returns once the handshake finished.
pub async fn spawn_peer(addr: SocketAddr, shared: PeerShared) -> Result<PeerHandle, NetworkError> {
    let stream = TcpStream::connect(addr).await?;
    let (mut rd, mut wr) = stream.into_split();
    let magic = Magic::from(shared.network);

    let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    handshake(addr, magic, &mut rd, &mut wr, &mut buf, &shared).await?;

    let (req_tx, req_rx) = mpsc::channel(16);
    tokio::spawn(run_peer(addr, magic, rd, wr, buf, req_rx, shared));
    Ok(PeerHandle { addr, req_tx })
}

async fn handshake(
    addr: SocketAddr,
    magic: Magic,
    rd: &mut OwnedReadHalf,
    wr: &mut OwnedWriteHalf,
    buf: &mut Vec<u8>,
    shared: &PeerShared,
) -> Result<(), NetworkError> {
    let local: SocketAddr = "0.0.0.0:0".parse().expect("constant address");
    let version = VersionMessage {
        version: PROTOCOL_VERSION,
        services: ServiceFlags::NONE,
        timestamp: chrono::Utc::now().timestamp(),
        receiver: address::Address::new(&addr, ServiceFlags::GETUTXO),
        sender: address::Address::new(&local, ServiceFlags::NONE),
        nonce: rand::random::<u64>(),
        user_agent: USER_AGENT.to_string(),
        start_height: 0,
        relay: true,
    };
    send(wr, magic, NetworkMessage::Version(version)).await?;

    let mut got_version = false;
    let mut got_verack = false;
    while !(got_version && got_verack) {
        let raw = read_frame(rd, buf).await?;
        match raw.payload() {
            NetworkMessage::Version(v) => {
                shared.state.best_height.fetch_max(v.start_height.max(0) as u32, Ordering::SeqCst);
                got_version = true;
                send(wr, magic, NetworkMessage::Verack).await?;
            }
            NetworkMessage::Verack => got_verack = true,
            _ => {}
        }
    }
    debug!(peer = %addr, "handshake complete");
    Ok(())
}

async fn run_peer(
    addr: SocketAddr,
    magic: Magic,
    mut rd: OwnedReadHalf,
    mut wr: OwnedWriteHalf,
    mut buf: Vec<u8>,
    mut req_rx: mpsc::Receiver<PeerRequest>,
    shared: PeerShared,
) {
    // The reply sender and query size of the one in-flight getutxos call.
    let mut pending_utxos: Option<(oneshot::Sender<Result<UtxosReply, NetworkError>>, usize)> =
        None;
    let mut chunk = vec![0u8; READ_CHUNK];

    'conn: loop {
        tokio::select! {
            request = req_rx.recv() => {
                let Some(request) = request else { break };
                match request {
                    PeerRequest::GetUtxos { outpoints, include_mempool, reply } => {
                        let payload = utxo::encode_getutxos(&outpoints, include_mempool);
                        let msg = NetworkMessage::Unknown {
                            command: utxo::getutxos_command(),
                            payload,
                        };
                        match send(&mut wr, magic, msg).await {
                            Ok(()) => pending_utxos = Some((reply, outpoints.len())),
                            Err(e) => { let _ = reply.send(Err(e)); break; }
                        }
                    }
                    PeerRequest::Broadcast { tx, reply } => {
                        let result = send(&mut wr, magic, NetworkMessage::Tx(tx)).await;
                        let failed = result.is_err();
                        let _ = reply.send(result);
                        if failed { break; }
                    }
                }
            }
            read = rd.read(&mut chunk) => {
                let n = match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => { warn!(peer = %addr, error = %e, "read failed"); break; }
                };
                buf.extend_from_slice(&chunk[..n]);
                loop {
                    let raw = match try_frame(&mut buf) {
                        Ok(Some(raw)) => raw,
                        Ok(None) => break,
                        Err(e) => { warn!(peer = %addr, error = %e, "framing error"); break 'conn; }
                    };
                    if let Err(e) = handle_message(addr, magic, &mut wr, raw, &shared, &mut pending_utxos).await {
                        warn!(peer = %addr, error = %e, "peer errored");
                        break 'conn;
                    }
                }
            }
        }
    }
    debug!(peer = %addr, "peer task finished");
    let _ = shared.notify_tx.send(ChainNotification::PeerSetChanged);
}

async fn handle_message(
    addr: SocketAddr,
    magic: Magic,
    wr: &mut OwnedWriteHalf,
    raw: RawNetworkMessage,
    shared: &PeerShared,
    pending_utxos: &mut Option<(oneshot::Sender<Result<UtxosReply, NetworkError>>, usize)>,
) -> Result<(), NetworkError> {
    match raw.payload() {
        NetworkMessage::Ping(nonce) => {
            send(wr, magic, NetworkMessage::Pong(*nonce)).await?;
        }
        NetworkMessage::Inv(items) => {
            let mut fetch = Vec::new();
            for item in items {
                match item {
                    Inventory::Block(hash) | Inventory::WitnessBlock(hash) => {
                        let height =
                            shared.state.best_height.fetch_add(1, Ordering::SeqCst) + 1;
                        let _ = shared.notify_tx.send(ChainNotification::TipChanged {
                            height: height as u64,
                            hash: *hash,
                        });
                    }
                    Inventory::Transaction(txid) | Inventory::WitnessTransaction(txid) => {
                        let mut broadcasts =
                            shared.state.broadcasts.lock().expect("broadcast lock");
                        if let Some(seen_by) = broadcasts.get_mut(txid) {
                            if seen_by.insert(addr) {
                                shared.state.broadcast_seen.notify_waiters();
                            }
                        }
                        drop(broadcasts);
                        let watching =
                            !shared.state.watched.lock().expect("watch lock").is_empty();
                        if watching {
                            fetch.push(Inventory::Transaction(*txid));
                        }
                    }
                    _ => {}
                }
            }
            if !fetch.is_empty() {
                send(wr, magic, NetworkMessage::GetData(fetch)).await?;
            }
        }
        NetworkMessage::Tx(tx) => {
            let spends: Vec<OutPoint> = {
                let watched = shared.state.watched.lock().expect("watch lock");
                tx.input
                    .iter()
                    .map(|i| i.previous_output)
                    .filter(|op| watched.contains(op))
                    .collect()
            };
            for outpoint in spends {
                let _ = shared.notify_tx.send(ChainNotification::SpendSeen {
                    outpoint,
                    spending_tx: tx.compute_txid(),
                });
            }
        }
        NetworkMessage::Unknown { command, payload } => {
            if command.to_string() == utxo::UTXOS_COMMAND {
                if let Some((reply, n_queried)) = pending_utxos.take() {
                    let _ = reply.send(utxo::decode_utxos(payload, n_queried));
                }
            }
        }
        _ => {}
    }
    Ok(())
}

async fn send(
    wr: &mut OwnedWriteHalf,
    magic: Magic,
    payload: NetworkMessage,
) -> Result<(), NetworkError> {
    let raw = RawNetworkMessage::new(magic, payload);
    wr.write_all(&encode::serialize(&raw)).await?;
    Ok(())
}

/// Pop one complete frame off the front of `buf`, if present.
fn try_frame(buf: &mut Vec<u8>) -> Result<Option<RawNetworkMessage>, NetworkError> {
    match encode::deserialize_partial::<RawNetworkMessage>(buf) {
        Ok((raw, consumed)) => {
            buf.drain(..consumed);
            Ok(Some(raw))
        }
        Err(encode::Error::Io(ref e)) if e.kind() == bitcoin::io::ErrorKind::UnexpectedEof => {
            Ok(None)
        }
        Err(e) => Err(NetworkError::Protocol(format!("bad frame: {e}"))),
    }
}

/// Read frames until one is complete (handshake phase only).
async fn read_frame(
    rd: &mut OwnedReadHalf,
    buf: &mut Vec<u8>,
) -> Result<RawNetworkMessage, NetworkError> {
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        if let Some(raw) = try_frame(buf)? {
            return Ok(raw);
        }
        let n = rd.read(&mut chunk).await?;
        if n == 0 {
            return Err(NetworkError::Disconnected("eof during handshake".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}
