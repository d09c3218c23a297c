//! Post-merge validation and resolution into a runnable [`Config`].

use std::net::SocketAddr;
use std::path::PathBuf;

use crate::project::{network_from_tag, FeePolicy};

use super::defaults;
use super::error::ConfigError;
use super::types::{Config, Settings};

/// Resolve merged settings against defaults and validate the result.
pub fn resolve(settings: Settings) -> Result<Config, ConfigError> {
    let net_tag = settings.net.as_deref().unwrap_or(defaults::DEFAULT_NET);
    let network = network_from_tag(net_tag)
        .ok_or_else(|| ConfigError::InvalidConfig(format!("unknown network '{net_tag}'")))?;

    let mut connect: Vec<SocketAddr> = Vec::new();
    if settings.local_node.unwrap_or(false) {
        connect.push(SocketAddr::from(([127, 0, 0, 1], defaults::default_port(network))));
    }
    for raw in settings.connect.unwrap_or_default() {
        let addr = parse_peer(&raw, network)?;
        if !connect.contains(&addr) {
            connect.push(addr);
        }
    }

    let listen = settings
        .listen
        .map(|raw| {
            raw.parse::<SocketAddr>()
                .map_err(|e| ConfigError::InvalidConfig(format!("bad listen address: {e}")))
        })
        .transpose()?;

    let utxo_quorum = settings.utxo_quorum.unwrap_or(defaults::DEFAULT_UTXO_QUORUM);
    if utxo_quorum == 0 {
        return Err(ConfigError::InvalidConfig("utxo quorum must be at least 1".into()));
    }
    // A lone peer is only trusted on test networks.
    if network == bitcoin::Network::Bitcoin && utxo_quorum < 2 {
        return Err(ConfigError::InvalidConfig(
            "mainnet requires a utxo quorum of at least 2".into(),
        ));
    }

    if settings.use_tor.unwrap_or(false) {
        return Err(ConfigError::InvalidConfig(
            "tor transport is not available in this build".into(),
        ));
    }

    let fee_policy = match settings.fee_policy.as_deref() {
        None | Some("zero-fee") => FeePolicy::ZeroFee,
        Some("wallet-funded") => FeePolicy::WalletFunded,
        Some(other) => {
            return Err(ConfigError::InvalidConfig(format!("unknown fee policy '{other}'")));
        }
    };

    Ok(Config {
        network,
        app_dir: settings.dir.unwrap_or_else(|| PathBuf::from(defaults::DEFAULT_DIR)),
        keystore: settings.keystore,
        connect,
        use_tor: false,
        listen,
        utxo_quorum,
        min_propagation: settings
            .min_propagation
            .unwrap_or(defaults::DEFAULT_MIN_PROPAGATION),
        fee_policy,
        peer_timeout_secs: settings
            .peer_timeout_secs
            .unwrap_or(defaults::DEFAULT_PEER_TIMEOUT_SECS),
        overall_timeout_secs: settings
            .overall_timeout_secs
            .unwrap_or(defaults::DEFAULT_OVERALL_TIMEOUT_SECS),
        broadcast_timeout_secs: settings
            .broadcast_timeout_secs
            .unwrap_or(defaults::DEFAULT_BROADCAST_TIMEOUT_SECS),
    })
}

fn parse_peer(raw: &str, network: bitcoin::Network) -> Result<SocketAddr, ConfigError> {
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return Ok(addr);
    }
    // Bare host: assume the network's default port.
    format!("{raw}:{}", defaults::default_port(network))
        .parse::<SocketAddr>()
        .map_err(|e| ConfigError::InvalidConfig(format!("bad peer address '{raw}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_to_mainnet() {
        let config = resolve(Settings::default()).unwrap();
        assert_eq!(config.network, bitcoin::Network::Bitcoin);
        assert_eq!(config.utxo_quorum, 2);
        assert!(config.listen.is_none());
    }

    #[test]
    fn lone_peer_quorum_rejected_on_mainnet() {
        let settings = Settings { utxo_quorum: Some(1), ..Default::default() };
        assert!(resolve(settings).is_err());

        let settings = Settings {
            net: Some("regtest".into()),
            utxo_quorum: Some(1),
            ..Default::default()
        };
        assert_eq!(resolve(settings).unwrap().utxo_quorum, 1);
    }

    #[test]
    fn local_node_implies_localhost_peer() {
        let settings = Settings {
            net: Some("regtest".into()),
            local_node: Some(true),
            ..Default::default()
        };
        let config = resolve(settings).unwrap();
        assert_eq!(config.connect, vec![SocketAddr::from(([127, 0, 0, 1], 18444))]);
    }
}
