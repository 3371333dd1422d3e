//! Environment variable overrides.
//!
//! Every scalar config key can be overridden by a variable named after its
//! dotted path, upper-cased, with `.` replaced by `_` and a `GLB_` prefix:
//! `health_check.interval` becomes `GLB_HEALTH_CHECK_INTERVAL`. Values use
//! the same notation as the YAML file. `GLB_BACKENDS` takes a
//! comma-separated list.

use crate::config::{Config, ConfigError};
use serde::de::DeserializeOwned;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

/// Prefix shared by every override variable.
pub const ENV_PREFIX: &str = "GLB";

/// Variable name for a dotted config key.
pub fn env_key(key: &str) -> String {
    format!("{}_{}", ENV_PREFIX, key.replace('.', "_").to_uppercase())
}

/// Apply overrides from `lookup` on top of a parsed config.
///
/// `lookup` maps a variable name to its value; pass
/// `|name| std::env::var(name).ok()` for the process environment.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let env = Overrides { lookup };

    let global = &mut config.global;
    env.set("global.log_level", &mut global.log_level, text)?;
    env.set("global.log_format", &mut global.log_format, yaml)?;
    env.set("global.log_file.enabled", &mut global.log_file.enabled, parsed)?;
    env.set("global.log_file.directory", &mut global.log_file.directory, parsed)?;
    env.set("global.log_file.prefix", &mut global.log_file.prefix, text)?;
    env.set("global.log_file.rotation", &mut global.log_file.rotation, yaml)?;
    env.set("global.log_file.max_files", &mut global.log_file.max_files, parsed)?;
    env.set("global.metrics.enabled", &mut global.metrics.enabled, parsed)?;
    env.set("global.metrics.address", &mut global.metrics.address, parsed)?;
    env.set("global.metrics.path", &mut global.metrics.path, text)?;

    env.set("listen", &mut config.listen, parsed)?;
    env.set("strategy", &mut config.strategy, yaml)?;
    env.set("backends", &mut config.backends, list)?;

    let hc = &mut config.health_check;
    env.set("health_check.path", &mut hc.path, text)?;
    env.set("health_check.interval", &mut hc.interval, duration)?;
    env.set("health_check.timeout", &mut hc.timeout, duration)?;

    env.set(
        "forward.connect_timeout",
        &mut config.forward.connect_timeout,
        duration,
    )?;

    Ok(())
}

struct Overrides<F> {
    lookup: F,
}

impl<F> Overrides<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn set<T>(
        &self,
        key: &str,
        slot: &mut T,
        parse: fn(&str) -> Result<T, String>,
    ) -> Result<(), ConfigError> {
        let variable = env_key(key);
        if let Some(raw) = (self.lookup)(&variable) {
            *slot = parse(raw.trim())
                .map_err(|reason| ConfigError::EnvOverride { variable, reason })?;
        }
        Ok(())
    }
}

fn text(raw: &str) -> Result<String, String> {
    Ok(raw.to_string())
}

fn parsed<T>(raw: &str) -> Result<T, String>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse().map_err(|e: T::Err| e.to_string())
}

/// Enums go through serde so the spelling matches the YAML file.
fn yaml<T: DeserializeOwned>(raw: &str) -> Result<T, String> {
    serde_yaml::from_str(raw).map_err(|e| e.to_string())
}

fn duration(raw: &str) -> Result<Duration, String> {
    humantime::parse_duration(raw).map_err(|e| e.to_string())
}

fn list(raw: &str) -> Result<Vec<String>, String> {
    Ok(raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LogFormat, LogRotation, Strategy};
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_env_key() {
        assert_eq!(env_key("listen"), "GLB_LISTEN");
        assert_eq!(env_key("health_check.interval"), "GLB_HEALTH_CHECK_INTERVAL");
        assert_eq!(env_key("global.log_file.max_files"), "GLB_GLOBAL_LOG_FILE_MAX_FILES");
    }

    #[test]
    fn test_overrides_replace_file_values() {
        let mut config = Config::default();
        config.backends = vec!["http://10.0.0.1".to_string()];

        apply_env_overrides(
            &mut config,
            env(&[
                ("GLB_LISTEN", "127.0.0.1:8181"),
                ("GLB_STRATEGY", "random"),
                ("GLB_BACKENDS", "http://10.0.0.7, http://10.0.0.8,"),
                ("GLB_HEALTH_CHECK_INTERVAL", "3s"),
                ("GLB_FORWARD_CONNECT_TIMEOUT", "250ms"),
                ("GLB_GLOBAL_LOG_FORMAT", "pretty"),
                ("GLB_GLOBAL_LOG_FILE_ENABLED", "true"),
                ("GLB_GLOBAL_LOG_FILE_ROTATION", "hourly"),
                ("GLB_GLOBAL_METRICS_ENABLED", "false"),
            ]),
        )
        .unwrap();

        assert_eq!(config.listen.port(), 8181);
        assert_eq!(config.strategy, Strategy::Random);
        assert_eq!(config.backends, vec!["http://10.0.0.7", "http://10.0.0.8"]);
        assert_eq!(config.health_check.interval, Duration::from_secs(3));
        assert_eq!(config.forward.connect_timeout, Duration::from_millis(250));
        assert_eq!(config.global.log_format, LogFormat::Pretty);
        assert!(config.global.log_file.enabled);
        assert_eq!(config.global.log_file.rotation, LogRotation::Hourly);
        assert!(!config.global.metrics.enabled);
        // Untouched keys keep their values.
        assert_eq!(config.health_check.path, "/health");
    }

    #[test]
    fn test_no_variables_is_a_no_op() {
        let mut config = Config::default();
        apply_env_overrides(&mut config, |_| None).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_bad_value_names_the_variable() {
        let mut config = Config::default();
        let err = apply_env_overrides(
            &mut config,
            env(&[("GLB_HEALTH_CHECK_TIMEOUT", "soon")]),
        )
        .unwrap_err();

        match err {
            ConfigError::EnvOverride { variable, .. } => {
                assert_eq!(variable, "GLB_HEALTH_CHECK_TIMEOUT")
            }
            other => panic!("expected env override error, got {:?}", other),
        }

        let err = apply_env_overrides(&mut config, env(&[("GLB_STRATEGY", "round_robin")]));
        assert!(matches!(err, Err(ConfigError::EnvOverride { .. })));
    }
}
