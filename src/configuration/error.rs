use thiserror::Error;

/// Configuration failures; all of them exit the node with code 1.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to load configuration file: {0}")]
    FileLoadError(String),

    #[error("environment variable error: {0}")]
    EnvVarError(String),
}
