//! Configuration types: the mergeable settings layer and the validated
//! final form.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::project::FeePolicy;

/// Partial settings as produced by one source (CLI, environment, file).
/// Every field is optional; sources merge with CLI > env > file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Network tag: "main", "test" or "regtest".
    pub net: Option<String>,
    /// Application directory holding projects and pledges.
    pub dir: Option<PathBuf>,
    /// Keystore file for the wallet (server/CLI mode).
    pub keystore: Option<PathBuf>,
    /// Connect to a Bitcoin node on localhost.
    pub local_node: Option<bool>,
    /// Explicit peer addresses, `host:port`.
    pub connect: Option<Vec<String>>,
    /// Route peer connections over Tor.
    pub use_tor: Option<bool>,
    /// Relay listen address; unset disables the HTTP relay.
    pub listen: Option<String>,
    /// Peers asked per UTXO query.
    pub utxo_quorum: Option<usize>,
    /// Peers that must echo a claim before it counts as propagated.
    pub min_propagation: Option<usize>,
    /// Claim fee policy: "zero-fee" or "wallet-funded".
    pub fee_policy: Option<String>,
    pub peer_timeout_secs: Option<u64>,
    pub overall_timeout_secs: Option<u64>,
    pub broadcast_timeout_secs: Option<u64>,
}

impl Settings {
    /// Merge, preferring `self` over `other`.
    pub fn merge(mut self, other: Settings) -> Settings {
        macro_rules! take {
            ($field:ident) => {
                if self.$field.is_none() {
                    self.$field = other.$field;
                }
            };
        }
        take!(net);
        take!(dir);
        take!(keystore);
        take!(local_node);
        take!(connect);
        take!(use_tor);
        take!(listen);
        take!(utxo_quorum);
        take!(min_propagation);
        take!(fee_policy);
        take!(peer_timeout_secs);
        take!(overall_timeout_secs);
        take!(broadcast_timeout_secs);
        self
    }
}

/// Fully resolved configuration the node runs with.
#[derive(Debug, Clone)]
pub struct Config {
    pub network: bitcoin::Network,
    pub app_dir: PathBuf,
    pub keystore: Option<PathBuf>,
    pub connect: Vec<SocketAddr>,
    pub use_tor: bool,
    pub listen: Option<SocketAddr>,
    pub utxo_quorum: usize,
    pub min_propagation: usize,
    pub fee_policy: FeePolicy,
    pub peer_timeout_secs: u64,
    pub overall_timeout_secs: u64,
    pub broadcast_timeout_secs: u64,
}
