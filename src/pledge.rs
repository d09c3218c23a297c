//! Pledge records: a decoded wire message paired with its canonical bytes.
//!
//! A pledge's identity is the SHA-256 of its canonical encoding, or the
//! embedded `orig_hash` once it has been scrubbed, so a scrubbed copy served
//! by a relay still names the same pledge.

use std::cmp::Ordering;

use bitcoin::hashes::{sha256, Hash};
use bitcoin::{OutPoint, Transaction};
use prost::Message;

use crate::error::CheckError;
use crate::wire::{self, PledgeDetails};

#[derive(Debug, Clone)]
pub struct Pledge {
    details: PledgeDetails,
    /// Canonical (non-delimited) encoding the hash is computed over.
    bytes: Vec<u8>,
    hash: sha256::Hash,
}

impl Pledge {
    pub fn from_details(details: PledgeDetails) -> Self {
        let bytes = details.encode_to_vec();
        let hash = sha256::Hash::hash(&bytes);
        Self { details, bytes, hash }
    }

    /// Decode a single length-delimited pledge message, as read from a file
    /// or HTTP body.
    pub fn decode_delimited(bytes: &[u8]) -> Result<Self, CheckError> {
        let details: PledgeDetails = wire::decode_delimited(bytes)
            .map_err(|e| CheckError::BadPledgeShape(format!("undecodable pledge: {e}")))?;
        Ok(Self::from_details(details))
    }

    pub fn details(&self) -> &PledgeDetails {
        &self.details
    }

    pub fn encoded(&self) -> &[u8] {
        &self.bytes
    }

    pub fn encode_delimited(&self) -> Vec<u8> {
        wire::encode_delimited(&self.details)
    }

    /// Hash of this pledge's canonical bytes.
    pub fn hash(&self) -> sha256::Hash {
        self.hash
    }

    /// Stable identity: `orig_hash` when scrubbed, canonical hash otherwise.
    pub fn identity(&self) -> sha256::Hash {
        match self.details.orig_hash.as_deref() {
            Some(orig) => sha256::Hash::from_slice(orig).unwrap_or(self.hash),
            None => self.hash,
        }
    }

    pub fn project_id(&self) -> Option<sha256::Hash> {
        sha256::Hash::from_slice(&self.details.project_id).ok()
    }

    pub fn total_input_value(&self) -> u64 {
        self.details.total_input_value
    }

    pub fn timestamp(&self) -> u64 {
        self.details.timestamp
    }

    pub fn is_scrubbed(&self) -> bool {
        self.details.orig_hash.is_some()
    }

    /// The pledge transaction. Full pledges carry exactly one.
    pub fn pledge_tx(&self) -> Result<Transaction, CheckError> {
        let raw = match self.details.transactions.as_slice() {
            [single] => single,
            [] => {
                return Err(CheckError::BadPledgeShape(
                    "pledge carries no transaction".into(),
                ));
            }
            _ => {
                return Err(CheckError::BadPledgeShape(
                    "pledge carries more than one transaction".into(),
                ));
            }
        };
        bitcoin::consensus::deserialize(raw)
            .map_err(|e| CheckError::BadPledgeShape(format!("undecodable transaction: {e}")))
    }

    /// Outpoints committed by this pledge, in input order.
    pub fn outpoints(&self) -> Result<Vec<OutPoint>, CheckError> {
        Ok(self.pledge_tx()?.input.iter().map(|i| i.previous_output).collect())
    }

    /// Irreversibly strip the transaction bytes, leaving metadata plus the
    /// hash of the full form.
    pub fn scrub(&self) -> Pledge {
        if self.is_scrubbed() {
            return self.clone();
        }
        let mut details = self.details.clone();
        details.transactions.clear();
        details.orig_hash = Some(self.hash.to_byte_array().to_vec());
        Pledge::from_details(details)
    }

    /// Display/assembly order: timestamp ascending, then identity ascending.
    pub fn sort_key(&self) -> (u64, sha256::Hash) {
        (self.details.timestamp, self.identity())
    }
}

impl PartialEq for Pledge {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for Pledge {}

impl PartialOrd for Pledge {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pledge {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::PledgeSpecifics;

    fn sample(timestamp: u64) -> Pledge {
        Pledge::from_details(PledgeDetails {
            project_id: vec![7; 32],
            total_input_value: 50_000,
            timestamp,
            transactions: vec![vec![1, 2, 3]],
            pledge_details: Some(PledgeSpecifics {
                name: Some("bob".into()),
                ..Default::default()
            }),
            orig_hash: None,
        })
    }

    #[test]
    fn scrub_keeps_identity_and_drops_transactions() {
        let full = sample(10);
        let scrubbed = full.scrub();
        assert!(scrubbed.is_scrubbed());
        assert!(scrubbed.details().transactions.is_empty());
        assert_eq!(scrubbed.identity(), full.identity());
        assert_ne!(scrubbed.hash(), full.hash());
    }

    #[test]
    fn ordering_is_timestamp_then_identity() {
        let a = sample(5);
        let b = sample(9);
        assert!(a < b);
    }
}
