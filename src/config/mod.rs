//! Configuration loading, parsing, and validation.

mod env;
mod loader;
mod types;
mod validation;
mod watcher;

pub use env::{apply_env_overrides, env_key, ENV_PREFIX};
pub use loader::{load_config, parse_config, parse_config_with_env, ConfigError};
pub use types::*;
pub use validation::validate_config;
pub use watcher::{ConfigWatcher, ReloadCallback};
