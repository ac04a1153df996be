//! Logging setup
//!
//! Console output goes to stderr so command output on stdout stays clean.
//! With `logging.log_dir` set, a JSON copy of every event is written to a
//! daily-rolling file through a non-blocking writer.

use crate::error::{AppError, Result};
use crate::infrastructure::config::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// `RUST_LOG` wins over the configured level
fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Install the global subscriber
///
/// The returned guard flushes the file writer on drop; keep it alive for
/// the life of the process.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let mut guard = None;

    let file_layer = match &config.log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir).map_err(|e| {
                AppError::config_error(format!(
                    "Failed to create log directory {}: {}",
                    log_dir.display(),
                    e
                ))
            })?;
            let appender =
                tracing_appender::rolling::daily(log_dir, format!("{}.log", config.file_prefix));
            let (writer, worker_guard) = tracing_appender::non_blocking(appender);
            guard = Some(worker_guard);

            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_filter(env_filter(&config.level)),
            )
        }
        None => None,
    };

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(config.ansi)
        .with_target(false)
        .with_filter(env_filter(&config.level));

    tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| AppError::config_error(format!("Failed to install logger: {}", e)))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_logging_returns_guard() {
        let temp_dir = TempDir::new().unwrap();
        let config = LoggingConfig {
            log_dir: Some(temp_dir.path().join("logs")),
            ansi: false,
            ..Default::default()
        };

        // Only one global subscriber per test binary; a second install errors
        match init_logging(&config) {
            Ok(guard) => {
                assert!(guard.is_some());
                assert!(temp_dir.path().join("logs").is_dir());
            }
            Err(e) => assert!(matches!(e, AppError::Config(_))),
        }
    }
}
