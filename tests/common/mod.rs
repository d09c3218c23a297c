//! Shared test harness: a scripted Bitcoin view, project builders and an
//! engine bootstrapper.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::{Amount, CompressedPublicKey, Network, OutPoint, ScriptBuf, Transaction, Txid};
use tokio::task::JoinHandle;

use lighthouse::disk::DiskManager;
use lighthouse::engine::{
    Engine, EngineConfig, EngineHandle, ProjectId, ProjectSnapshot,
};
use lighthouse::mirror::Mirror;
use lighthouse::networking::error::NetworkError;
use lighthouse::networking::utxo::UtxoEntry;
use lighthouse::networking::{BitcoinView, PeerUtxoAnswer};
use lighthouse::project::Project;
use lighthouse::wallet::{KeyStoreWallet, WalletAdapter, PledgeCreation, PledgerDetails};
use lighthouse::wallet::keys::KeyStore;
use lighthouse::wire::{ExtraDetails, Output, ProjectDetails, ProjectMessage};

/// Scripted stand-in for a peer group. Each "peer" answers UTXO queries
/// from its own map; unknown outpoints count as spent.
pub struct MockView {
    peers: AtomicUsize,
    answers: Mutex<Vec<HashMap<OutPoint, UtxoEntry>>>,
    /// How many peers answer UTXO queries; the rest stay silent.
    responding: AtomicUsize,
    pub broadcasts: Mutex<Vec<Transaction>>,
    broadcast_peers: AtomicUsize,
    pub watched: Mutex<HashSet<OutPoint>>,
}

impl MockView {
    pub fn new(peers: usize) -> Arc<Self> {
        Arc::new(Self {
            peers: AtomicUsize::new(peers),
            answers: Mutex::new(vec![HashMap::new(); peers]),
            responding: AtomicUsize::new(peers),
            broadcasts: Mutex::new(Vec::new()),
            broadcast_peers: AtomicUsize::new(peers),
            watched: Mutex::new(HashSet::new()),
        })
    }

    /// Only the first `n` peers answer UTXO queries from now on.
    pub fn set_responding(&self, n: usize) {
        self.responding.store(n, Ordering::SeqCst);
    }

    /// Every peer reports `outpoint` unspent with this entry.
    pub fn utxo_everywhere(&self, outpoint: OutPoint, entry: UtxoEntry) {
        for peer in self.answers.lock().unwrap().iter_mut() {
            peer.insert(outpoint, entry.clone());
        }
    }

    /// Only peer `index` reports the outpoint unspent.
    pub fn utxo_on_peer(&self, index: usize, outpoint: OutPoint, entry: UtxoEntry) {
        self.answers.lock().unwrap()[index].insert(outpoint, entry);
    }

    /// Every peer reports the outpoint spent.
    pub fn spend_everywhere(&self, outpoint: &OutPoint) {
        for peer in self.answers.lock().unwrap().iter_mut() {
            peer.remove(outpoint);
        }
    }

    pub fn set_broadcast_peers(&self, peers: usize) {
        self.broadcast_peers.store(peers, Ordering::SeqCst);
    }
}

#[async_trait]
impl BitcoinView for MockView {
    async fn get_utxos(
        &self,
        outpoints: &[OutPoint],
        _include_mempool: bool,
    ) -> Result<Vec<PeerUtxoAnswer>, NetworkError> {
        let answers = self.answers.lock().unwrap();
        let responding = self.responding.load(Ordering::SeqCst);
        if answers.is_empty() || responding == 0 {
            return Err(NetworkError::Offline);
        }
        Ok(answers
            .iter()
            .take(responding)
            .enumerate()
            .map(|(index, peer)| PeerUtxoAnswer {
                peer: format!("mock-{index}"),
                chain_height: 100,
                utxos: outpoints
                    .iter()
                    .map(|op| (*op, peer.get(op).cloned()))
                    .collect(),
            })
            .collect())
    }

    async fn broadcast(
        &self,
        tx: Transaction,
        min_propagation: usize,
    ) -> Result<usize, NetworkError> {
        let reached = self.broadcast_peers.load(Ordering::SeqCst);
        self.broadcasts.lock().unwrap().push(tx);
        if reached >= min_propagation {
            Ok(reached)
        } else {
            Err(NetworkError::InsufficientPropagation(reached))
        }
    }

    async fn watch_outpoints(&self, outpoints: Vec<OutPoint>) {
        self.watched.lock().unwrap().extend(outpoints);
    }

    fn peer_count(&self) -> usize {
        self.peers.load(Ordering::SeqCst)
    }
}

fn project_details(goal: u64, min_pledge: u64, auth_key: &[u8]) -> ProjectDetails {
    let secp = Secp256k1::new();
    let beneficiary = SecretKey::from_slice(&[0x42; 32]).unwrap();
    let script = ScriptBuf::new_p2wpkh(
        &CompressedPublicKey(beneficiary.public_key(&secp)).wpubkey_hash(),
    );
    ProjectDetails {
        network: Some("regtest".into()),
        outputs: vec![Output { amount: goal, script: script.into_bytes() }],
        time: 1_700_000_000,
        memo: Some("fix the lighthouse roof".into()),
        extra_details: Some(ExtraDetails {
            title: "roof".into(),
            cover_image: None,
            auth_key: auth_key.to_vec(),
            min_pledge_size: min_pledge,
        }),
        ..Default::default()
    }
}

/// A regtest project paying one P2WPKH output of `goal` satoshis.
pub fn test_project(goal: u64, min_pledge: u64, auth_key: &[u8]) -> Project {
    let details = project_details(goal, min_pledge, auth_key);
    Project::from_message(ProjectMessage::from_details(&details)).unwrap()
}

/// Same, but carrying a pledge-server base URL.
pub fn test_project_with_server(
    goal: u64,
    min_pledge: u64,
    auth_key: &[u8],
    server: &str,
) -> Project {
    let mut details = project_details(goal, min_pledge, auth_key);
    details.payment_url = Some(server.to_string());
    Project::from_message(ProjectMessage::from_details(&details)).unwrap()
}

/// Deterministic auth keypair for relay tests.
pub fn auth_keypair(byte: u8) -> (SecretKey, Vec<u8>) {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
    let pk = sk.public_key(&secp);
    (sk, pk.serialize().to_vec())
}

/// Fresh wallet holding one fake coin of `value` satoshis.
pub async fn funded_wallet(value: u64) -> (Arc<KeyStoreWallet>, OutPoint) {
    let keys = KeyStore::generate(Network::Regtest).unwrap();
    let wallet = Arc::new(KeyStoreWallet::new(keys));
    let outpoint = OutPoint { txid: random_txid(), vout: 0 };
    wallet.fund(outpoint, Amount::from_sat(value)).await.unwrap();
    (wallet, outpoint)
}

pub fn random_txid() -> Txid {
    let bytes: [u8; 32] = rand::random();
    Txid::from_byte_array(bytes)
}

/// Create a pledge and serve its stub on every mock peer.
pub async fn pledge_with_utxo(
    wallet: &Arc<KeyStoreWallet>,
    view: &Arc<MockView>,
    project: &Project,
    amount: u64,
    name: &str,
) -> PledgeCreation {
    let creation = wallet
        .create_pledge(
            project,
            Amount::from_sat(amount),
            PledgerDetails { name: Some(name.into()), ..Default::default() },
        )
        .await
        .unwrap();
    view.utxo_everywhere(creation.stub_outpoint, stub_entry(&creation));
    creation
}

/// The UTXO entry a peer would serve for a pledge's stub outpoint.
pub fn stub_entry(creation: &PledgeCreation) -> UtxoEntry {
    let stub = &creation.stub_tx.output[creation.stub_outpoint.vout as usize];
    UtxoEntry { value: stub.value, script: stub.script_pubkey.clone(), height: Some(100) }
}

pub struct TestNode {
    pub handle: EngineHandle,
    pub projects: Mirror<ProjectId, ProjectSnapshot>,
    pub disk: DiskManager,
    pub task: JoinHandle<()>,
}

/// Boot an engine over the mock view in `dir`.
pub async fn start_engine(
    view: Arc<MockView>,
    wallet: Option<Arc<dyn WalletAdapter>>,
    dir: &std::path::Path,
) -> TestNode {
    let disk = DiskManager::open(dir).await.unwrap();
    let view: Arc<dyn BitcoinView> = view;
    let (mut engine, handle) = Engine::new(
        view,
        wallet,
        disk.clone(),
        EngineConfig { min_propagation: 2, ..Default::default() },
    );
    let projects = engine.mirror();
    let task = tokio::spawn(engine.run());
    TestNode { handle, projects, disk, task }
}

/// Poll until `check` passes or two seconds elapse.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within two seconds");
}
