//! Logging initialization and configuration.

use crate::config::{LogFileConfig, LogFormat, LogRotation};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG`, when set, takes precedence over `level`. When the log file is
/// enabled every record is also written as JSON to a rolling file; the
/// returned guard flushes that file and must be held until exit.
pub fn init_logging(
    level: &str,
    format: &LogFormat,
    file: &LogFileConfig,
) -> Result<Option<WorkerGuard>, InitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file_writer, guard) = if file.enabled {
        let (writer, guard) = tracing_appender::non_blocking(rolling_appender(file)?);
        (Some(writer), Some(guard))
    } else {
        (None, None)
    };

    let (json, pretty) = match format {
        LogFormat::Json => (
            Some(fmt::layer().json().flatten_event(true).with_current_span(false)),
            None,
        ),
        LogFormat::Pretty => (None, Some(fmt::layer().pretty())),
    };
    let file_layer = file_writer.map(|writer| {
        fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_ansi(false)
            .with_writer(writer)
    });

    // try_init so a second call (tests, embedding) is not fatal
    let result = tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(pretty)
        .with(file_layer)
        .try_init();

    if let Err(e) = result {
        tracing::debug!(error = %e, "logging already initialized");
    }

    Ok(guard)
}

/// Build the rolling file writer described by `file`.
fn rolling_appender(file: &LogFileConfig) -> Result<RollingFileAppender, InitError> {
    let rotation = match file.rotation {
        LogRotation::Hourly => Rotation::HOURLY,
        LogRotation::Daily => Rotation::DAILY,
        LogRotation::Never => Rotation::NEVER,
    };

    RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(file.prefix.as_str())
        .filename_suffix("log")
        .max_log_files(file.max_files)
        .build(&file.directory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_init_twice_is_harmless() {
        let disabled = LogFileConfig::default();
        assert!(init_logging("warn", &LogFormat::Pretty, &disabled).unwrap().is_none());
        assert!(init_logging("debug", &LogFormat::Json, &disabled).unwrap().is_none());
    }

    #[test]
    fn test_rolling_appender_writes_into_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = LogFileConfig {
            enabled: true,
            directory: dir.path().to_path_buf(),
            prefix: "glb".to_string(),
            rotation: LogRotation::Never,
            max_files: 3,
        };

        let mut appender = rolling_appender(&file).unwrap();
        appender.write_all(b"{\"message\":\"hello\"}\n").unwrap();
        appender.flush().unwrap();

        let written = std::fs::read_to_string(dir.path().join("glb.log")).unwrap();
        assert_eq!(written, "{\"message\":\"hello\"}\n");
    }

    #[test]
    fn test_enabled_file_returns_guard() {
        let dir = tempfile::tempdir().unwrap();
        let file = LogFileConfig {
            enabled: true,
            directory: dir.path().to_path_buf(),
            ..LogFileConfig::default()
        };

        let guard = init_logging("info", &LogFormat::Json, &file).unwrap();
        assert!(guard.is_some());
    }
}
