//! Key material for the reference wallet.
//!
//! Keys derive from a single seed over BIP32. Pledge keys live under
//! `m/1'/<index>`; the per-project auth key uses the derivation path the
//! project records in its `merchant_data`, so any wallet holding the seed
//! can re-derive it.

use std::path::Path;
use std::str::FromStr;

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{self, ecdsa, All, Message, Secp256k1, SecretKey};
use bitcoin::{CompressedPublicKey, Network, ScriptBuf};
use serde::{Deserialize, Serialize};

use super::WalletError;

/// Serialized keystore file contents.
#[derive(Serialize, Deserialize)]
struct KeyStoreFile {
    network: String,
    seed: String,
    next_index: u32,
}

pub struct KeyStore {
    secp: Secp256k1<All>,
    master: Xpriv,
    network: Network,
    seed: [u8; 32],
    next_index: u32,
}

impl KeyStore {
    pub fn new(network: Network, seed: [u8; 32]) -> Result<Self, WalletError> {
        let master = Xpriv::new_master(network, &seed)
            .map_err(|e| WalletError::Keys(e.to_string()))?;
        Ok(Self { secp: Secp256k1::new(), master, network, seed, next_index: 0 })
    }

    pub fn generate(network: Network) -> Result<Self, WalletError> {
        let mut seed = [0u8; 32];
        use secp256k1::rand::RngCore;
        secp256k1::rand::thread_rng().fill_bytes(&mut seed);
        Self::new(network, seed)
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Allocate the next pledge key; returns its index.
    pub fn fresh_index(&mut self) -> u32 {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    pub fn secret_key(&self, index: u32) -> Result<SecretKey, WalletError> {
        let path = [
            ChildNumber::from_hardened_idx(1).map_err(|e| WalletError::Keys(e.to_string()))?,
            ChildNumber::from_normal_idx(index).map_err(|e| WalletError::Keys(e.to_string()))?,
        ];
        let child = self
            .master
            .derive_priv(&self.secp, &path)
            .map_err(|e| WalletError::Keys(e.to_string()))?;
        Ok(child.private_key)
    }

    pub fn public_key(&self, index: u32) -> Result<secp256k1::PublicKey, WalletError> {
        Ok(self.secret_key(index)?.public_key(&self.secp))
    }

    /// P2WPKH script paying the key at `index`.
    pub fn script_for(&self, index: u32) -> Result<ScriptBuf, WalletError> {
        let pk = CompressedPublicKey(self.public_key(index)?);
        Ok(ScriptBuf::new_p2wpkh(&pk.wpubkey_hash()))
    }

    /// Auth key for a project, re-derived from the path in `merchant_data`.
    pub fn auth_secret(&self, merchant_data: Option<&[u8]>) -> Result<SecretKey, WalletError> {
        let path_str = merchant_data
            .and_then(|b| std::str::from_utf8(b).ok())
            .unwrap_or("m/2'/0");
        let path = DerivationPath::from_str(path_str)
            .map_err(|e| WalletError::Keys(format!("bad auth path: {e}")))?;
        let child = self
            .master
            .derive_priv(&self.secp, &path)
            .map_err(|e| WalletError::Keys(e.to_string()))?;
        Ok(child.private_key)
    }

    pub fn auth_public(&self, merchant_data: Option<&[u8]>) -> Result<secp256k1::PublicKey, WalletError> {
        Ok(self.auth_secret(merchant_data)?.public_key(&self.secp))
    }

    /// ECDSA over SHA-256 of `msg` with the project auth key, DER-encoded.
    pub fn sign_auth(&self, merchant_data: Option<&[u8]>, msg: &[u8]) -> Result<Vec<u8>, WalletError> {
        let sk = self.auth_secret(merchant_data)?;
        let digest = sha256::Hash::hash(msg).to_byte_array();
        let sig: ecdsa::Signature = self.secp.sign_ecdsa(&Message::from_digest(digest), &sk);
        Ok(sig.serialize_der().to_vec())
    }

    pub fn secp(&self) -> &Secp256k1<All> {
        &self.secp
    }

    pub async fn save(&self, path: &Path) -> Result<(), WalletError> {
        let file = KeyStoreFile {
            network: crate::project::network_tag(self.network).to_string(),
            seed: hex::encode(self.seed),
            next_index: self.next_index,
        };
        let bytes = serde_json::to_vec_pretty(&file)
            .map_err(|e| WalletError::Keys(e.to_string()))?;
        tokio::fs::write(path, bytes).await.map_err(|e| WalletError::Keys(e.to_string()))
    }

    pub async fn load(path: &Path) -> Result<Self, WalletError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| WalletError::Keys(e.to_string()))?;
        let file: KeyStoreFile =
            serde_json::from_slice(&bytes).map_err(|e| WalletError::Keys(e.to_string()))?;
        let network = crate::project::network_from_tag(&file.network)
            .ok_or_else(|| WalletError::Keys("unknown keystore network".into()))?;
        let seed_vec =
            hex::decode(&file.seed).map_err(|e| WalletError::Keys(e.to_string()))?;
        let seed: [u8; 32] =
            seed_vec.try_into().map_err(|_| WalletError::Keys("bad seed length".into()))?;
        let mut store = Self::new(network, seed)?;
        store.next_index = file.next_index;
        Ok(store)
    }
}
