//! Configuration file loading.

use crate::config::{apply_env_overrides, validate_config, Config};
use std::path::Path;
use thiserror::Error;

/// Errors raised while loading configuration or building a backend pool from it.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("configuration validation failed: {0}")]
    ValidationError(String),

    #[error("backend list is empty")]
    EmptyBackends,

    #[error("invalid backend address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("invalid value in {variable}: {reason}")]
    EnvOverride { variable: String, reason: String },
}

/// Load configuration from a YAML file.
///
/// Reads the file, parses the YAML, applies `GLB_*` environment overrides,
/// and validates the result. A config that
/// comes back from here is safe to hand to [`BackendRegistry::new`].
///
/// [`BackendRegistry::new`]: crate::backend::BackendRegistry::new
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    parse_config(&contents)
}

/// Parse configuration from a YAML string, then apply overrides from the
/// process environment and validate.
pub fn parse_config(contents: &str) -> Result<Config, ConfigError> {
    parse_config_with_env(contents, |name| std::env::var(name).ok())
}

/// Like [`parse_config`], with overrides taken from `lookup`.
pub fn parse_config_with_env<F>(contents: &str, lookup: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config: Config = serde_yaml::from_str(contents)?;
    apply_env_overrides(&mut config, lookup)?;
    validate_config(&config).map_err(ConfigError::ValidationError)?;
    Ok(config)
}
