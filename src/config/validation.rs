//! Configuration validation.

use crate::backend::parse_base_url;
use crate::config::Config;
use std::collections::HashSet;

/// Validate the configuration.
///
/// Checks for:
/// - At least one backend, each a parseable http(s) URL with a host
/// - No duplicate backend URLs
/// - Non-zero probe interval and timeout, timeout not above the interval
/// - A probe path starting with `/`
/// - A known log level
/// - A usable log file sink, when enabled
///
/// # Returns
///
/// `Ok(())` if valid, or an error message describing every problem found.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();

    if config.backends.is_empty() {
        errors.push("at least one backend must be defined".to_string());
    }

    let mut seen = HashSet::new();
    for address in &config.backends {
        match parse_base_url(address) {
            Ok(url) => {
                if !seen.insert(url.to_string()) {
                    errors.push(format!("duplicate backend address: {}", address));
                }
            }
            Err(reason) => {
                errors.push(format!("invalid backend address '{}': {}", address, reason));
            }
        }
    }

    let hc = &config.health_check;
    if hc.interval.is_zero() {
        errors.push("health_check.interval must be greater than zero".to_string());
    }
    if hc.timeout.is_zero() {
        errors.push("health_check.timeout must be greater than zero".to_string());
    }
    if !hc.interval.is_zero() && hc.timeout > hc.interval {
        errors.push(format!(
            "health_check.timeout ({}) must not exceed health_check.interval ({})",
            humantime::format_duration(hc.timeout),
            humantime::format_duration(hc.interval)
        ));
    }
    if !hc.path.starts_with('/') {
        errors.push(format!(
            "health_check.path '{}' must start with '/'",
            hc.path
        ));
    }

    if config.forward.connect_timeout.is_zero() {
        errors.push("forward.connect_timeout must be greater than zero".to_string());
    }

    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.global.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "invalid log level '{}', must be one of: {}",
            config.global.log_level,
            valid_levels.join(", ")
        ));
    }

    let log_file = &config.global.log_file;
    if log_file.enabled {
        if log_file.prefix.trim().is_empty() {
            errors.push("global.log_file.prefix must not be empty".to_string());
        }
        if log_file.max_files == 0 {
            errors.push("global.log_file.max_files must be at least 1".to_string());
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}
