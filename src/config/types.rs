//! Configuration data types.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// Global settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// Address and port the balancer listens on
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Backend selection strategy
    #[serde(default)]
    pub strategy: Strategy,

    /// Ordered list of backend base URLs (scheme + host)
    #[serde(default)]
    pub backends: Vec<String>,

    /// Active health probing
    #[serde(default)]
    pub health_check: HealthCheckConfig,

    /// Upstream forwarding settings
    #[serde(default)]
    pub forward: ForwardConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            global: GlobalConfig::default(),
            listen: default_listen(),
            strategy: Strategy::default(),
            backends: Vec::new(),
            health_check: HealthCheckConfig::default(),
            forward: ForwardConfig::default(),
        }
    }
}

/// Global configuration settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct GlobalConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,

    /// Rotating JSON log file, written alongside stdout
    #[serde(default)]
    pub log_file: LogFileConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Json,
            log_file: LogFileConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Log file sink.
///
/// Files are named `<prefix>.<date>.log` inside `directory`; only the newest
/// `max_files` are kept.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LogFileConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_log_directory")]
    pub directory: PathBuf,

    #[serde(default = "default_log_prefix")]
    pub prefix: String,

    #[serde(default)]
    pub rotation: LogRotation,

    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LogFileConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: default_log_directory(),
            prefix: default_log_prefix(),
            rotation: LogRotation::default(),
            max_files: default_max_log_files(),
        }
    }
}

/// How often the log file is rolled over.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

/// Metrics endpoint configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether metrics endpoint is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Address to bind metrics server
    #[serde(default = "default_metrics_address")]
    pub address: SocketAddr,

    /// Path for metrics endpoint
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_metrics_address(),
            path: default_metrics_path(),
        }
    }
}

/// Backend selection strategy.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    LeastConnections,
    Random,
}

/// Health probe settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    /// Path requested on every backend
    #[serde(default = "default_probe_path")]
    pub path: String,

    /// How often a probe cycle starts
    #[serde(default = "default_health_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Timeout for a single probe
    #[serde(default = "default_health_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: default_probe_path(),
            interval: default_health_interval(),
            timeout: default_health_timeout(),
        }
    }
}

/// Upstream forwarding settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ForwardConfig {
    /// TCP connect timeout towards a backend
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
        }
    }
}

// Default value functions
fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_log_directory() -> PathBuf {
    PathBuf::from("./logs")
}

fn default_log_prefix() -> String {
    "glb".to_string()
}

fn default_max_log_files() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_metrics_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_probe_path() -> String {
    "/health".to_string()
}

fn default_health_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Serde adapter for humantime durations ("10s", "250ms").
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
