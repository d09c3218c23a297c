//! Wire messages for projects, pledges and project statuses.
//!
//! Every file and HTTP body is a single length-delimited binary message. The
//! `ProjectDetails` layout is bit-compatible with the BIP70 `PaymentDetails`
//! message (fields 1-7), extended with an `ExtraDetails` sub-message; keeping
//! the details serialized inside the outer envelope makes the canonical hash
//! stable regardless of how a peer re-encodes the outer message.
//!
//! Canonical hashing is SHA-256 over the plain (non-delimited) encoding.

use bitcoin::hashes::{sha256, Hash};
use prost::Message;

/// A single `(amount, script)` pair. Mirrors BIP70 `Output`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Output {
    /// Amount in satoshis.
    #[prost(uint64, tag = "1")]
    pub amount: u64,
    /// The scriptPubKey the amount is locked to, as raw script bytes.
    #[prost(bytes = "vec", tag = "2")]
    pub script: Vec<u8>,
}

/// Lighthouse-specific extension carried inside `ProjectDetails`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExtraDetails {
    /// Human-readable project title.
    #[prost(string, tag = "1")]
    pub title: String,
    /// Optional cover image (PNG/JPEG bytes), displayed by UIs as-is.
    #[prost(bytes = "vec", optional, tag = "2")]
    pub cover_image: Option<Vec<u8>>,
    /// Serialized secp256k1 point identifying the project creator.
    #[prost(bytes = "vec", tag = "3")]
    pub auth_key: Vec<u8>,
    /// Smallest acceptable single-pledge value in satoshis.
    #[prost(uint64, tag = "4")]
    pub min_pledge_size: u64,
}

/// Project definition. Fields 1-7 follow BIP70 `PaymentDetails`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProjectDetails {
    /// Network tag: "main", "test" or "regtest". Absent means "main".
    #[prost(string, optional, tag = "1")]
    pub network: Option<String>,
    /// Ordered outputs; their sum is the goal amount.
    #[prost(message, repeated, tag = "2")]
    pub outputs: Vec<Output>,
    /// Creation time, seconds since the epoch.
    #[prost(uint64, tag = "3")]
    pub time: u64,
    #[prost(uint64, optional, tag = "4")]
    pub expires: Option<u64>,
    /// Free-form project description.
    #[prost(string, optional, tag = "5")]
    pub memo: Option<String>,
    /// Pledge server URL, when the project uses a relay.
    #[prost(string, optional, tag = "6")]
    pub payment_url: Option<String>,
    /// Opaque owner data; the owning wallet records its auth-key derivation
    /// path here.
    #[prost(bytes = "vec", optional, tag = "7")]
    pub merchant_data: Option<Vec<u8>>,
    #[prost(message, optional, tag = "8")]
    pub extra_details: Option<ExtraDetails>,
}

/// Outer project envelope, the unit that is hashed and stored on disk.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProjectMessage {
    #[prost(uint32, optional, tag = "1")]
    pub version: Option<u32>,
    /// Serialized `ProjectDetails`, kept as bytes so the project id is stable.
    #[prost(bytes = "vec", tag = "2")]
    pub serialized_details: Vec<u8>,
}

/// Pledger-supplied metadata attached to a pledge.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PledgeSpecifics {
    #[prost(string, optional, tag = "1")]
    pub memo: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub contact_address: Option<String>,
}

/// A pledge: either full (carries the pledge transaction) or scrubbed
/// (transactions cleared, `orig_hash` set to the hash of the full form).
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PledgeDetails {
    /// Canonical hash of the project this pledge commits to.
    #[prost(bytes = "vec", tag = "1")]
    pub project_id: Vec<u8>,
    /// Declared sum of the pledged input values, in satoshis.
    #[prost(uint64, tag = "2")]
    pub total_input_value: u64,
    /// Seconds since the epoch; advisory, monotonic per pledger.
    #[prost(uint64, tag = "3")]
    pub timestamp: u64,
    /// Raw Bitcoin transactions whose outputs reproduce the project outputs.
    /// Empty on scrubbed pledges.
    #[prost(bytes = "vec", repeated, tag = "4")]
    pub transactions: Vec<Vec<u8>>,
    #[prost(message, optional, tag = "5")]
    pub pledge_details: Option<PledgeSpecifics>,
    /// Hash of the full pledge message. Present iff the pledge is scrubbed.
    #[prost(bytes = "vec", optional, tag = "6")]
    pub orig_hash: Option<Vec<u8>>,
}

/// Snapshot of a project as served by a relay.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProjectStatus {
    #[prost(bytes = "vec", tag = "1")]
    pub id: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub timestamp: u64,
    #[prost(uint64, tag = "3")]
    pub value_pledged_so_far: u64,
    #[prost(message, repeated, tag = "4")]
    pub pledges: Vec<PledgeDetails>,
    /// Claim transaction id, once the project has been claimed.
    #[prost(bytes = "vec", optional, tag = "5")]
    pub claimed_by: Option<Vec<u8>>,
}

/// SHA-256 over the canonical (non-delimited) encoding of a message.
pub fn canonical_hash<M: Message>(msg: &M) -> sha256::Hash {
    sha256::Hash::hash(&msg.encode_to_vec())
}

/// Encode a message with the varint length prefix used for files and HTTP
/// bodies.
pub fn encode_delimited<M: Message>(msg: &M) -> Vec<u8> {
    msg.encode_length_delimited_to_vec()
}

/// Decode a single length-delimited message from a buffer.
pub fn decode_delimited<M: Message + Default>(bytes: &[u8]) -> Result<M, prost::DecodeError> {
    M::decode_length_delimited(bytes)
}

impl ProjectMessage {
    /// Wrap freshly built details into the outer envelope.
    pub fn from_details(details: &ProjectDetails) -> Self {
        Self { version: Some(1), serialized_details: details.encode_to_vec() }
    }

    pub fn details(&self) -> Result<ProjectDetails, prost::DecodeError> {
        ProjectDetails::decode(self.serialized_details.as_slice())
    }

    /// Stable identity of the project: hash of the canonical envelope bytes.
    pub fn id_hash(&self) -> sha256::Hash {
        canonical_hash(self)
    }
}
