//! Environment source: `LIGHTHOUSE_*` variables.

use std::path::PathBuf;

use crate::configuration::error::ConfigError;
use crate::configuration::types::Settings;

const PREFIX: &str = "LIGHTHOUSE_";

fn var(name: &str) -> Option<String> {
    std::env::var(format!("{PREFIX}{name}")).ok().filter(|v| !v.is_empty())
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    var(name)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| ConfigError::EnvVarError(format!("{PREFIX}{name}: {e}")))
        })
        .transpose()
}

pub fn load_env_vars() -> Result<Settings, ConfigError> {
    Ok(Settings {
        net: var("NET"),
        dir: var("DIR").map(PathBuf::from),
        keystore: var("KEYSTORE").map(PathBuf::from),
        local_node: parse_var("LOCAL_NODE")?,
        connect: var("CONNECT").map(|v| v.split(',').map(str::to_string).collect()),
        use_tor: parse_var("USE_TOR")?,
        listen: var("LISTEN"),
        utxo_quorum: parse_var("UTXO_QUORUM")?,
        min_propagation: parse_var("MIN_PROPAGATION")?,
        fee_policy: var("FEE_POLICY"),
        peer_timeout_secs: parse_var("PEER_TIMEOUT_SECS")?,
        overall_timeout_secs: parse_var("OVERALL_TIMEOUT_SECS")?,
        broadcast_timeout_secs: parse_var("BROADCAST_TIMEOUT_SECS")?,
    })
}
