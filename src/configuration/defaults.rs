//! Default values applied after all sources merged.

pub const DEFAULT_NET: &str = "main";
pub const DEFAULT_DIR: &str = "./lighthouse-data";
pub const DEFAULT_UTXO_QUORUM: usize = 2;
pub const DEFAULT_MIN_PROPAGATION: usize = 2;
pub const DEFAULT_PEER_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_OVERALL_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_BROADCAST_TIMEOUT_SECS: u64 = 120;

/// Default p2p port per network.
pub fn default_port(network: bitcoin::Network) -> u16 {
    match network {
        bitcoin::Network::Bitcoin => 8333,
        bitcoin::Network::Regtest => 18444,
        _ => 18333,
    }
}
