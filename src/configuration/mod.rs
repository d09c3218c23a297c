pub mod defaults;
pub mod error;
pub mod sources;
pub mod types;
pub mod validation;

pub use error::ConfigError;
pub use sources::cli::Cli;
pub use types::{Config, Settings};

/// Load the configuration from all sources with priority CLI > env > file,
/// then validate the merged result.
pub fn load_configuration(cli: &Cli) -> Result<Config, ConfigError> {
    let cli_settings = cli.to_settings();
    let env_settings = sources::env::load_env_vars()?;
    let file_settings = match &cli.config {
        Some(path) => sources::file::load_config_file(path)?,
        None => Settings::default(),
    };

    let merged = cli_settings.merge(env_settings).merge(file_settings);
    validation::resolve(merged)
}
