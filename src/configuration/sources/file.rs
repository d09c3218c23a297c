//! Configuration-file source (YAML).

use std::path::Path;

use crate::configuration::error::ConfigError;
use crate::configuration::types::Settings;

#[cfg(feature = "serde_yaml")]
pub fn load_config_file(path: &Path) -> Result<Settings, ConfigError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::FileLoadError(format!("{}: {e}", path.display())))?;
    serde_yaml::from_str(&raw)
        .map_err(|e| ConfigError::FileLoadError(format!("{}: {e}", path.display())))
}

#[cfg(not(feature = "serde_yaml"))]
pub fn load_config_file(path: &Path) -> Result<Settings, ConfigError> {
    let raw = std::fs::read(path)
        .map_err(|e| ConfigError::FileLoadError(format!("{}: {e}", path.display())))?;
    serde_json::from_slice(&raw)
        .map_err(|e| ConfigError::FileLoadError(format!("{}: {e}", path.display())))
}
