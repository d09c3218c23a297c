//! Validated, immutable view of a project definition.
//!
//! Construction rejects malformed messages; afterwards every accessor is
//! infallible. The local (no-network) pledge checks and the claim-transaction
//! assembly live here; anything that needs a live UTXO view belongs to the
//! engine.

use std::collections::HashSet;

use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{self, ecdsa, Message, Secp256k1};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{
    absolute, transaction, Amount, Network, OutPoint, ScriptBuf, Transaction, TxIn, TxOut,
};

use crate::error::CheckError;
use crate::pledge::Pledge;
use crate::wire::{self, ExtraDetails, ProjectDetails, ProjectMessage};

/// Consensus maximum of spendable satoshis.
pub const MAX_MONEY: u64 = 21_000_000 * 100_000_000;

/// Default relay dust threshold in satoshis.
pub const DUST_THRESHOLD: u64 = 546;

/// A pledge below 4x dust cannot pay its own way into a contract.
pub const MIN_PLEDGE_DUST_MULTIPLE: u64 = 4;

/// Reject pledge transactions larger than this many bytes.
pub const MAX_PLEDGE_TX_SIZE: usize = 100_000;

/// The sighash every pledge input must be signed with:
/// `SIGHASH_ALL | SIGHASH_ANYONECANPAY`.
pub const PLEDGE_SIGHASH: u8 = 0x81;

/// How the claim transaction pays for its own relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeePolicy {
    /// Pledges sum exactly to the goal; the contract carries no fee.
    #[default]
    ZeroFee,
    /// The wallet adds one fee-bearing input and an equal change output.
    WalletFunded,
}

#[derive(Debug, Clone)]
pub struct Project {
    message: ProjectMessage,
    details: ProjectDetails,
    extra: ExtraDetails,
    id: sha256::Hash,
    network: Network,
    auth_key: secp256k1::PublicKey,
    outputs: Vec<TxOut>,
    goal: u64,
}

impl Project {
    /// Decode and validate a single length-delimited project file or body.
    pub fn decode_delimited(bytes: &[u8]) -> Result<Self, CheckError> {
        let message: ProjectMessage = wire::decode_delimited(bytes)
            .map_err(|e| CheckError::BadProject(format!("undecodable project: {e}")))?;
        Self::from_message(message)
    }

    pub fn from_message(message: ProjectMessage) -> Result<Self, CheckError> {
        let details = message
            .details()
            .map_err(|e| CheckError::BadProject(format!("undecodable details: {e}")))?;
        let network = network_from_tag(details.network.as_deref().unwrap_or("main"))
            .ok_or_else(|| CheckError::BadProject("unrecognized network".into()))?;

        if details.outputs.is_empty() {
            return Err(CheckError::BadProject("project has no outputs".into()));
        }
        let mut outputs = Vec::with_capacity(details.outputs.len());
        let mut goal: u64 = 0;
        for out in &details.outputs {
            if out.amount == 0 || out.amount > MAX_MONEY {
                return Err(CheckError::BadProject("output amount out of range".into()));
            }
            if out.script.is_empty() {
                return Err(CheckError::BadProject("output script is empty".into()));
            }
            goal = goal
                .checked_add(out.amount)
                .filter(|g| *g <= MAX_MONEY)
                .ok_or_else(|| CheckError::BadProject("goal exceeds maximum money".into()))?;
            outputs.push(TxOut {
                value: Amount::from_sat(out.amount),
                script_pubkey: ScriptBuf::from_bytes(out.script.clone()),
            });
        }

        let extra = details
            .extra_details
            .clone()
            .ok_or_else(|| CheckError::BadProject("missing extra details".into()))?;
        let min = extra.min_pledge_size;
        if min < DUST_THRESHOLD * MIN_PLEDGE_DUST_MULTIPLE || min > goal {
            return Err(CheckError::BadProject("min pledge out of range".into()));
        }
        let auth_key = secp256k1::PublicKey::from_slice(&extra.auth_key)
            .map_err(|_| CheckError::BadProject("auth key is not a curve point".into()))?;

        let id = message.id_hash();
        Ok(Self { message, details, extra, id, network, auth_key, outputs, goal })
    }

    pub fn id_hash(&self) -> sha256::Hash {
        self.id
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn goal_amount(&self) -> u64 {
        self.goal
    }

    pub fn min_pledge(&self) -> u64 {
        self.extra.min_pledge_size
    }

    pub fn outputs(&self) -> &[TxOut] {
        &self.outputs
    }

    pub fn auth_key(&self) -> &secp256k1::PublicKey {
        &self.auth_key
    }

    pub fn title(&self) -> &str {
        &self.extra.title
    }

    pub fn memo(&self) -> Option<&str> {
        self.details.memo.as_deref()
    }

    pub fn server_url(&self) -> Option<&str> {
        self.details.payment_url.as_deref()
    }

    pub fn cover_image(&self) -> Option<&[u8]> {
        self.extra.cover_image.as_deref()
    }

    pub fn merchant_data(&self) -> Option<&[u8]> {
        self.details.merchant_data.as_deref()
    }

    pub fn message(&self) -> &ProjectMessage {
        &self.message
    }

    pub fn encode_delimited(&self) -> Vec<u8> {
        wire::encode_delimited(&self.message)
    }

    /// Inputs-only pledge checks that need no network access.
    pub fn check_pledge_shape(&self, pledge: &Pledge) -> Result<(), CheckError> {
        if pledge.is_scrubbed() {
            return Err(CheckError::BadPledgeShape(
                "scrubbed pledge cannot be verified".into(),
            ));
        }
        let tx = pledge.pledge_tx()?;
        if tx.total_size() > MAX_PLEDGE_TX_SIZE {
            return Err(CheckError::BadPledgeShape("pledge transaction too large".into()));
        }
        if tx.output != self.outputs {
            return Err(CheckError::BadPledgeShape(
                "pledge outputs do not reproduce the project outputs".into(),
            ));
        }
        if tx.input.is_empty() {
            return Err(CheckError::BadPledgeShape("pledge has no inputs".into()));
        }
        for (i, input) in tx.input.iter().enumerate() {
            if input.previous_output.is_null() {
                return Err(CheckError::BadPledgeShape(format!(
                    "input {i} looks like a coinbase"
                )));
            }
            let flag = input_sighash_flag(input).ok_or_else(|| {
                CheckError::BadPledgeShape(format!("input {i} carries no signature"))
            })?;
            if flag != PLEDGE_SIGHASH {
                return Err(CheckError::BadPledgeShape(format!(
                    "input {i} is not signed ALL|ANYONECANPAY"
                )));
            }
        }
        if pledge.total_input_value() < self.min_pledge() {
            return Err(CheckError::PledgeTooSmall);
        }
        if pledge.total_input_value() > self.goal {
            return Err(CheckError::GoalExceeded);
        }
        Ok(())
    }

    /// Build the claim transaction from verified-open pledges.
    ///
    /// Inputs are the union of all pledge inputs in deterministic pledge
    /// order; the ANYONECANPAY signatures stay valid because each input signs
    /// only itself plus the fixed outputs.
    pub fn assemble_contract(&self, pledges: &[Pledge]) -> Result<Transaction, CheckError> {
        let mut ordered: Vec<&Pledge> = pledges.iter().collect();
        ordered.sort_by_key(|p| p.sort_key());

        let mut inputs = Vec::new();
        let mut seen: HashSet<OutPoint> = HashSet::new();
        let mut total: u64 = 0;
        for pledge in &ordered {
            let tx = pledge.pledge_tx()?;
            for input in tx.input {
                if !seen.insert(input.previous_output) {
                    return Err(CheckError::DuplicatedOutpoint);
                }
                inputs.push(input);
            }
            total = total
                .checked_add(pledge.total_input_value())
                .ok_or(CheckError::ValueMismatch(i64::MAX))?;
        }
        if total != self.goal {
            return Err(CheckError::ValueMismatch(total as i64 - self.goal as i64));
        }
        Ok(Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: inputs,
            output: self.outputs.clone(),
        })
    }

    /// Execute a pledge input's signature against the quorum-agreed UTXO it
    /// spends. Covers the standard templates a pledge wallet produces; other
    /// scripts cannot be checked locally and are refused.
    pub fn verify_input_script(
        &self,
        tx: &Transaction,
        input_index: usize,
        utxo_value: Amount,
        utxo_script: &ScriptBuf,
    ) -> Result<(), CheckError> {
        let input = tx
            .input
            .get(input_index)
            .ok_or_else(|| CheckError::ScriptFailed("input index out of range".into()))?;
        let secp = Secp256k1::verification_only();
        let mut cache = SighashCache::new(tx);

        let (sig_bytes, pubkey_bytes) = if utxo_script.is_p2wpkh() {
            let sig = input
                .witness
                .nth(0)
                .ok_or_else(|| CheckError::ScriptFailed("missing witness signature".into()))?;
            let pk = input
                .witness
                .nth(1)
                .ok_or_else(|| CheckError::ScriptFailed("missing witness pubkey".into()))?;
            (sig.to_vec(), pk.to_vec())
        } else if utxo_script.is_p2pkh() {
            script_sig_pushes(&input.script_sig)
                .ok_or_else(|| CheckError::ScriptFailed("malformed scriptSig".into()))?
        } else {
            return Err(CheckError::ScriptFailed("unsupported script template".into()));
        };

        let (der, flag) = sig_bytes
            .split_last()
            .map(|(flag, der)| (der, *flag))
            .ok_or_else(|| CheckError::ScriptFailed("empty signature".into()))?;
        if flag != PLEDGE_SIGHASH {
            return Err(CheckError::ScriptFailed("wrong sighash flag".into()));
        }
        let sighash_ty = EcdsaSighashType::from_standard(flag as u32)
            .map_err(|_| CheckError::ScriptFailed("non-standard sighash".into()))?;
        let signature = ecdsa::Signature::from_der(der)
            .map_err(|_| CheckError::ScriptFailed("undecodable DER signature".into()))?;
        let pubkey = secp256k1::PublicKey::from_slice(&pubkey_bytes)
            .map_err(|_| CheckError::ScriptFailed("undecodable pubkey".into()))?;

        let digest: [u8; 32] = if utxo_script.is_p2wpkh() {
            cache
                .p2wpkh_signature_hash(input_index, utxo_script, utxo_value, sighash_ty)
                .map_err(|e| CheckError::ScriptFailed(format!("sighash: {e}")))?
                .to_byte_array()
        } else {
            cache
                .legacy_signature_hash(input_index, utxo_script, flag as u32)
                .map_err(|e| CheckError::ScriptFailed(format!("sighash: {e}")))?
                .to_byte_array()
        };
        secp.verify_ecdsa(&Message::from_digest(digest), &signature, &pubkey)
            .map_err(|_| CheckError::ScriptFailed("signature does not verify".into()))
    }

    /// Check a relay auth signature: ECDSA over SHA-256 of `msg` under the
    /// project auth key.
    pub fn verify_auth(&self, msg: &[u8], sig_der: &[u8]) -> Result<(), CheckError> {
        let secp = Secp256k1::verification_only();
        let digest = sha256::Hash::hash(msg).to_byte_array();
        let signature =
            ecdsa::Signature::from_der(sig_der).map_err(|_| CheckError::Unauthorized)?;
        secp.verify_ecdsa(&Message::from_digest(digest), &signature, &self.auth_key)
            .map_err(|_| CheckError::Unauthorized)
    }
}

/// Map a project network tag onto consensus parameters.
pub fn network_from_tag(tag: &str) -> Option<Network> {
    match tag {
        "main" => Some(Network::Bitcoin),
        "test" => Some(Network::Testnet),
        "regtest" => Some(Network::Regtest),
        _ => None,
    }
}

pub fn network_tag(network: Network) -> &'static str {
    match network {
        Network::Bitcoin => "main",
        Network::Regtest => "regtest",
        _ => "test",
    }
}

/// Sighash flag of the input's signature, wherever the signature lives.
fn input_sighash_flag(input: &TxIn) -> Option<u8> {
    if !input.witness.is_empty() {
        return input.witness.nth(0).and_then(|sig| sig.last()).copied();
    }
    let (sig, _) = script_sig_pushes(&input.script_sig)?;
    sig.last().copied()
}

/// Extract the `(signature, pubkey)` pushes of a P2PKH-style scriptSig.
fn script_sig_pushes(script: &ScriptBuf) -> Option<(Vec<u8>, Vec<u8>)> {
    use bitcoin::script::Instruction;
    let mut pushes = Vec::new();
    for inst in script.instructions() {
        match inst.ok()? {
            Instruction::PushBytes(b) => pushes.push(b.as_bytes().to_vec()),
            Instruction::Op(_) => return None,
        }
    }
    match pushes.as_slice() {
        [sig, pk] => Some((sig.clone(), pk.clone())),
        _ => None,
    }
}

