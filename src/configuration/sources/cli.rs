//! Command-line source.

use std::path::PathBuf;

use clap::Parser;

use crate::configuration::types::Settings;

/// Assurance-contract crowdfunding node for Bitcoin.
#[derive(Debug, Parser)]
#[command(name = "lighthoused", version, about)]
pub struct Cli {
    /// Network to operate on.
    #[arg(long, value_parser = ["main", "test", "regtest"])]
    pub net: Option<String>,

    /// Application directory with project and pledge files.
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// Keystore file for the wallet.
    #[arg(long)]
    pub keystore: Option<PathBuf>,

    /// Use a Bitcoin node running on localhost.
    #[arg(long)]
    pub local_node: bool,

    /// Comma-separated peer addresses to connect to.
    #[arg(long, value_delimiter = ',')]
    pub connect: Vec<String>,

    /// Route connections over Tor (unsupported in this build).
    #[arg(long)]
    pub use_tor: bool,

    /// Serve the pledge relay on this address, e.g. 0.0.0.0:13765.
    #[arg(long)]
    pub listen: Option<String>,

    /// Optional configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Cli {
    pub fn to_settings(&self) -> Settings {
        Settings {
            net: self.net.clone(),
            dir: self.dir.clone(),
            keystore: self.keystore.clone(),
            local_node: self.local_node.then_some(true),
            connect: (!self.connect.is_empty()).then(|| self.connect.clone()),
            use_tor: self.use_tor.then_some(true),
            listen: self.listen.clone(),
            ..Default::default()
        }
    }
}
