//! Transaction construction for the reference wallet: stub transactions,
//! pledge transactions signed `ALL|ANYONECANPAY`, and revocations.

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{All, Message, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{
    absolute, transaction, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut,
    Witness,
};

use super::WalletError;

/// An output the wallet can spend: P2WPKH paying one of its keys.
#[derive(Debug, Clone)]
pub struct OwnedUtxo {
    pub outpoint: OutPoint,
    pub value: Amount,
    pub script: ScriptBuf,
    pub key_index: u32,
}

/// Unsigned skeleton with the keys needed to finish it.
pub struct BuiltTx {
    pub tx: Transaction,
    /// Key index per input, aligned with `tx.input`.
    pub input_keys: Vec<(u32, Amount, ScriptBuf)>,
}

/// Spend `inputs` into `outputs`; no change computation here.
pub fn build_spend(inputs: &[OwnedUtxo], outputs: Vec<TxOut>) -> BuiltTx {
    let tx = Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: inputs
            .iter()
            .map(|u| TxIn {
                previous_output: u.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs,
    };
    let input_keys = inputs
        .iter()
        .map(|u| (u.key_index, u.value, u.script.clone()))
        .collect();
    BuiltTx { tx, input_keys }
}

/// Sign every P2WPKH input of a built transaction with the given sighash
/// type.
pub fn sign_all_inputs(
    secp: &Secp256k1<All>,
    built: &mut BuiltTx,
    key_for: impl Fn(u32) -> Result<SecretKey, WalletError>,
    sighash_type: EcdsaSighashType,
) -> Result<(), WalletError> {
    let mut witnesses = Vec::with_capacity(built.input_keys.len());
    {
        let mut cache = SighashCache::new(&built.tx);
        for (index, (key_index, value, script)) in built.input_keys.iter().enumerate() {
            let digest = cache
                .p2wpkh_signature_hash(index, script, *value, sighash_type)
                .map_err(|e| WalletError::Signing(e.to_string()))?;
            let sk = key_for(*key_index)?;
            let pk = sk.public_key(secp);
            let sig = secp.sign_ecdsa(&Message::from_digest(digest.to_byte_array()), &sk);
            let signature = bitcoin::ecdsa::Signature { signature: sig, sighash_type };
            witnesses.push(Witness::p2wpkh(&signature, &pk));
        }
    }
    for (input, witness) in built.tx.input.iter_mut().zip(witnesses) {
        input.witness = witness;
    }
    Ok(())
}

/// Select owned utxos summing to at least `target`, largest first.
pub fn select_utxos(available: &[OwnedUtxo], target: Amount) -> Result<Vec<OwnedUtxo>, WalletError> {
    let mut sorted: Vec<OwnedUtxo> = available.to_vec();
    sorted.sort_by_key(|u| std::cmp::Reverse(u.value));
    let mut selected = Vec::new();
    let mut total = Amount::ZERO;
    for utxo in sorted {
        if total >= target {
            break;
        }
        total += utxo.value;
        selected.push(utxo);
    }
    if total < target {
        return Err(WalletError::InsufficientFunds { have: total, need: target });
    }
    Ok(selected)
}

