//! The wallet capability the engine consumes, plus a reference
//! implementation backed by a keystore file.
//!
//! The engine never holds keys: it asks the adapter to create pledges,
//! revoke them, finalize claims under the configured fee policy and sign
//! relay auth challenges. Stub-outpoint spends are observed through the
//! Bitcoin view's outpoint watcher, which the engine already feeds with
//! every pledge input.

pub mod keys;
pub mod transaction;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use async_trait::async_trait;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1;
use bitcoin::sighash::EcdsaSighashType;
use bitcoin::{Amount, OutPoint, ScriptBuf, Transaction, TxOut};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::pledge::Pledge;
use crate::project::{FeePolicy, Project};
use crate::wire::{PledgeDetails, PledgeSpecifics};
use keys::KeyStore;
use transaction::{build_spend, select_utxos, sign_all_inputs, OwnedUtxo};

/// Flat fee the wallet attaches when the claim policy asks it to.
const WALLET_CLAIM_FEE: Amount = Amount::from_sat(10_000);

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("wallet holds {have} but needs {need}")]
    InsufficientFunds { have: Amount, need: Amount },
    #[error("key handling failed: {0}")]
    Keys(String),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("pledge is not owned by this wallet")]
    UnknownPledge,
}

/// Pledger-supplied strings attached to a new pledge.
#[derive(Debug, Clone, Default)]
pub struct PledgerDetails {
    pub name: Option<String>,
    pub contact: Option<String>,
    pub memo: Option<String>,
}

/// Result of creating a pledge: the pledge itself plus the stub funding
/// transaction that must confirm before the pledge verifies.
#[derive(Debug, Clone)]
pub struct PledgeCreation {
    pub pledge: Pledge,
    pub stub_tx: Transaction,
    pub stub_outpoint: OutPoint,
}

/// What the engine needs from a wallet.
#[async_trait]
pub trait WalletAdapter: Send + Sync + 'static {
    /// Atomically build a pledge of `amount` towards `project` and reserve
    /// the coins behind it.
    async fn create_pledge(
        &self,
        project: &Project,
        amount: Amount,
        details: PledgerDetails,
    ) -> Result<PledgeCreation, WalletError>;

    /// Build the transaction that revokes an own pledge by spending its stub
    /// outpoint back to the wallet. The caller broadcasts it.
    async fn revoke(&self, pledge: &Pledge) -> Result<Transaction, WalletError>;

    async fn pledges_for(&self, project_id: &sha256::Hash) -> Vec<Pledge>;

    /// Sign a relay auth challenge with the project's auth key.
    async fn sign_auth(&self, project: &Project, msg: &[u8]) -> Result<Vec<u8>, WalletError>;

    /// Apply the fee policy to an assembled claim transaction.
    async fn finalize_claim(
        &self,
        tx: Transaction,
        policy: FeePolicy,
    ) -> Result<Transaction, WalletError>;
}

struct WalletInner {
    keys: KeyStore,
    utxos: HashMap<OutPoint, OwnedUtxo>,
    reserved: HashSet<OutPoint>,
    /// Own pledges per project, with the stub each one spends.
    own: HashMap<sha256::Hash, Vec<(Pledge, OutPoint)>>,
    keystore_path: Option<PathBuf>,
}

/// Reference wallet: in-memory coins, keys from a keystore file.
pub struct KeyStoreWallet {
    inner: Mutex<WalletInner>,
}

impl KeyStoreWallet {
    pub fn new(keys: KeyStore) -> Self {
        Self {
            inner: Mutex::new(WalletInner {
                keys,
                utxos: HashMap::new(),
                reserved: HashSet::new(),
                own: HashMap::new(),
                keystore_path: None,
            }),
        }
    }

    pub async fn load_or_generate(
        path: PathBuf,
        network: bitcoin::Network,
    ) -> Result<Self, WalletError> {
        let keys = match KeyStore::load(&path).await {
            Ok(keys) => keys,
            Err(_) => {
                info!(path = %path.display(), "creating new keystore");
                let keys = KeyStore::generate(network)?;
                keys.save(&path).await?;
                keys
            }
        };
        let wallet = Self::new(keys);
        wallet.inner.lock().await.keystore_path = Some(path);
        Ok(wallet)
    }

    /// Credit the wallet with a spendable coin on a fresh key. Returns the
    /// script so test harnesses can serve it as a UTXO.
    pub async fn fund(&self, outpoint: OutPoint, value: Amount) -> Result<ScriptBuf, WalletError> {
        let mut inner = self.inner.lock().await;
        let key_index = inner.keys.fresh_index();
        let script = inner.keys.script_for(key_index)?;
        inner
            .utxos
            .insert(outpoint, OwnedUtxo { outpoint, value, script: script.clone(), key_index });
        Ok(script)
    }

    pub async fn balance(&self) -> Amount {
        let inner = self.inner.lock().await;
        inner
            .utxos
            .values()
            .filter(|u| !inner.reserved.contains(&u.outpoint))
            .map(|u| u.value)
            .fold(Amount::ZERO, |a, b| a + b)
    }

    /// The auth public key a new project of this wallet would carry.
    pub async fn auth_public(
        &self,
        merchant_data: Option<&[u8]>,
    ) -> Result<secp256k1::PublicKey, WalletError> {
        self.inner.lock().await.keys.auth_public(merchant_data)
    }

    async fn persist(&self, inner: &WalletInner) {
        if let Some(path) = &inner.keystore_path {
            if let Err(e) = inner.keys.save(path).await {
                tracing::warn!(error = %e, "keystore save failed");
            }
        }
    }
}

#[async_trait]
impl WalletAdapter for KeyStoreWallet {
    async fn create_pledge(
        &self,
        project: &Project,
        amount: Amount,
        details: PledgerDetails,
    ) -> Result<PledgeCreation, WalletError> {
        let mut inner = self.inner.lock().await;

        let available: Vec<OwnedUtxo> = inner
            .utxos
            .values()
            .filter(|u| !inner.reserved.contains(&u.outpoint))
            .cloned()
            .collect();
        let funding = select_utxos(&available, amount)?;
        let funding_total =
            funding.iter().map(|u| u.value).fold(Amount::ZERO, |a, b| a + b);

        // Stub transaction: the pledged amount onto a fresh key, change back.
        let stub_index = inner.keys.fresh_index();
        let stub_script = inner.keys.script_for(stub_index)?;
        let mut outputs = vec![TxOut { value: amount, script_pubkey: stub_script.clone() }];
        let change = funding_total - amount;
        let change_index = inner.keys.fresh_index();
        if change > Amount::ZERO {
            outputs.push(TxOut {
                value: change,
                script_pubkey: inner.keys.script_for(change_index)?,
            });
        }
        let mut stub_built = build_spend(&funding, outputs);
        {
            let keys = &inner.keys;
            sign_all_inputs(
                keys.secp(),
                &mut stub_built,
                |i| keys.secret_key(i),
                EcdsaSighashType::All,
            )?;
        }
        let stub_tx = stub_built.tx;
        let stub_outpoint = OutPoint { txid: stub_tx.compute_txid(), vout: 0 };

        // Pledge transaction: the stub into the fixed project outputs,
        // signed so anyone can combine it with other pledges.
        let stub_utxo = OwnedUtxo {
            outpoint: stub_outpoint,
            value: amount,
            script: stub_script,
            key_index: stub_index,
        };
        let mut pledge_built =
            build_spend(std::slice::from_ref(&stub_utxo), project.outputs().to_vec());
        {
            let keys = &inner.keys;
            sign_all_inputs(
                keys.secp(),
                &mut pledge_built,
                |i| keys.secret_key(i),
                EcdsaSighashType::AllPlusAnyoneCanPay,
            )?;
        }
        let pledge_tx = pledge_built.tx;

        let pledge = Pledge::from_details(PledgeDetails {
            project_id: project.id_hash().as_byte_array().to_vec(),
            total_input_value: amount.to_sat(),
            timestamp: chrono::Utc::now().timestamp().max(0) as u64,
            transactions: vec![bitcoin::consensus::serialize(&pledge_tx)],
            pledge_details: Some(PledgeSpecifics {
                memo: details.memo,
                name: details.name,
                contact_address: details.contact,
            }),
            orig_hash: None,
        });

        // Commit: spent coins out, stub and change in, stub reserved.
        for spent in &funding {
            inner.utxos.remove(&spent.outpoint);
        }
        inner.utxos.insert(stub_outpoint, stub_utxo);
        if change > Amount::ZERO {
            let txid = stub_tx.compute_txid();
            let change_outpoint = OutPoint { txid, vout: 1 };
            let change_script = inner.keys.script_for(change_index)?;
            inner.utxos.insert(
                change_outpoint,
                OwnedUtxo {
                    outpoint: change_outpoint,
                    value: change,
                    script: change_script,
                    key_index: change_index,
                },
            );
        }
        inner.reserved.insert(stub_outpoint);
        inner
            .own
            .entry(project.id_hash())
            .or_default()
            .push((pledge.clone(), stub_outpoint));
        self.persist(&inner).await;

        Ok(PledgeCreation { pledge, stub_tx, stub_outpoint })
    }

    async fn revoke(&self, pledge: &Pledge) -> Result<Transaction, WalletError> {
        let mut inner = self.inner.lock().await;
        let identity = pledge.identity();
        let stub = inner
            .own
            .values()
            .flatten()
            .find(|(own, _)| own.identity() == identity)
            .map(|(_, stub)| *stub)
            .ok_or(WalletError::UnknownPledge)?;
        let stub_utxo = inner.utxos.get(&stub).cloned().ok_or(WalletError::UnknownPledge)?;

        let dest_index = inner.keys.fresh_index();
        let dest_script = inner.keys.script_for(dest_index)?;
        let mut built = build_spend(
            std::slice::from_ref(&stub_utxo),
            vec![TxOut { value: stub_utxo.value, script_pubkey: dest_script }],
        );
        {
            let keys = &inner.keys;
            sign_all_inputs(keys.secp(), &mut built, |i| keys.secret_key(i), EcdsaSighashType::All)?;
        }

        inner.reserved.remove(&stub);
        inner.utxos.remove(&stub);
        let txid = built.tx.compute_txid();
        let dest_script_for_insert = inner.keys.script_for(dest_index)?;
        inner.utxos.insert(
            OutPoint { txid, vout: 0 },
            OwnedUtxo {
                outpoint: OutPoint { txid, vout: 0 },
                value: stub_utxo.value,
                script: dest_script_for_insert,
                key_index: dest_index,
            },
        );
        self.persist(&inner).await;
        Ok(built.tx)
    }

    async fn pledges_for(&self, project_id: &sha256::Hash) -> Vec<Pledge> {
        let inner = self.inner.lock().await;
        inner
            .own
            .get(project_id)
            .map(|v| v.iter().map(|(p, _)| p.clone()).collect())
            .unwrap_or_default()
    }

    async fn sign_auth(&self, project: &Project, msg: &[u8]) -> Result<Vec<u8>, WalletError> {
        let inner = self.inner.lock().await;
        inner.keys.sign_auth(project.merchant_data(), msg)
    }

    async fn finalize_claim(
        &self,
        tx: Transaction,
        policy: FeePolicy,
    ) -> Result<Transaction, WalletError> {
        match policy {
            FeePolicy::ZeroFee => Ok(tx),
            FeePolicy::WalletFunded => {
                let mut inner = self.inner.lock().await;
                let available: Vec<OwnedUtxo> = inner
                    .utxos
                    .values()
                    .filter(|u| !inner.reserved.contains(&u.outpoint))
                    .cloned()
                    .collect();
                let fee_inputs = select_utxos(&available, WALLET_CLAIM_FEE)?;
                let fee_total =
                    fee_inputs.iter().map(|u| u.value).fold(Amount::ZERO, |a, b| a + b);

                let mut outputs = tx.output.clone();
                let change = fee_total - WALLET_CLAIM_FEE;
                if change > Amount::ZERO {
                    let change_index = inner.keys.fresh_index();
                    outputs.push(TxOut {
                        value: change,
                        script_pubkey: inner.keys.script_for(change_index)?,
                    });
                }

                // Existing pledge inputs keep their ANYONECANPAY witnesses;
                // only the appended wallet inputs are signed here.
                let appended = build_spend(&fee_inputs, Vec::new());
                let mut combined = tx.clone();
                combined.output = outputs;
                let base = combined.input.len();
                combined.input.extend(appended.tx.input);

                let mut built = transaction::BuiltTx {
                    tx: combined,
                    input_keys: Vec::new(),
                };
                let mut cache = bitcoin::sighash::SighashCache::new(&built.tx);
                let mut witnesses = Vec::new();
                for (offset, utxo) in fee_inputs.iter().enumerate() {
                    let digest = cache
                        .p2wpkh_signature_hash(
                            base + offset,
                            &utxo.script,
                            utxo.value,
                            EcdsaSighashType::All,
                        )
                        .map_err(|e| WalletError::Signing(e.to_string()))?;
                    let sk = inner.keys.secret_key(utxo.key_index)?;
                    let sig = inner.keys.secp().sign_ecdsa(
                        &bitcoin::secp256k1::Message::from_digest(digest.to_byte_array()),
                        &sk,
                    );
                    let signature = bitcoin::ecdsa::Signature {
                        signature: sig,
                        sighash_type: EcdsaSighashType::All,
                    };
                    witnesses.push((base + offset, bitcoin::Witness::p2wpkh(&signature, &sk.public_key(inner.keys.secp()))));
                }
                drop(cache);
                for (index, witness) in witnesses {
                    built.tx.input[index].witness = witness;
                }
                for spent in &fee_inputs {
                    inner.utxos.remove(&spent.outpoint);
                }
                self.persist(&inner).await;
                Ok(built.tx)
            }
        }
    }
}
