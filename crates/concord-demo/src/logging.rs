//! Logging setup for the demo binary
//!
//! Console output filtered by `RUST_LOG` (falling back to the configured
//! level), plus an optional daily-rotated `concord.log`.

use std::path::PathBuf;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::LogSettings;

const LOG_FILE_NAME: &str = "concord.log";
const DEFAULT_LOG_DIR: &str = "logs";

/// Resolved logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_dir: PathBuf,
    pub console_output: bool,
    pub file_logging: bool,
    pub level: Level,
}

impl LoggingConfig {
    pub fn from_settings(settings: &LogSettings) -> Self {
        Self {
            log_dir: PathBuf::from(settings.dir.as_deref().unwrap_or(DEFAULT_LOG_DIR)),
            console_output: settings.console,
            file_logging: settings.file,
            level: settings.level.parse().unwrap_or(Level::INFO),
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.level.to_string()))
    }
}

/// Keeps the non-blocking file writer alive; flushes on drop
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<LoggingGuard> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    let mut file_guard = None;

    if config.console_output {
        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_filter(config.filter());
        layers.push(Box::new(console_layer));
    }

    if config.file_logging {
        std::fs::create_dir_all(&config.log_dir)?;
        let appender = RollingFileAppender::new(Rotation::DAILY, &config.log_dir, LOG_FILE_NAME);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        file_guard = Some(guard);

        let file_layer = fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(false)
            .with_filter(config.filter());
        layers.push(Box::new(file_layer));
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    if config.file_logging {
        tracing::info!(
            log_dir = %config.log_dir.display(),
            "File logging initialized: {}",
            LOG_FILE_NAME
        );
    }

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_settings() {
        let config = LoggingConfig::from_settings(&LogSettings {
            level: "debug".to_string(),
            console: false,
            file: true,
            dir: Some("/tmp/concord-logs".to_string()),
        });
        assert_eq!(config.log_dir, PathBuf::from("/tmp/concord-logs"));
        assert!(!config.console_output);
        assert!(config.file_logging);
        assert_eq!(config.level, Level::DEBUG);
    }

    #[test]
    fn test_unknown_level_falls_back_to_info() {
        let config = LoggingConfig::from_settings(&LogSettings {
            level: "chatty".to_string(),
            ..Default::default()
        });
        assert_eq!(config.level, Level::INFO);
        assert_eq!(config.log_dir, PathBuf::from(DEFAULT_LOG_DIR));
    }
}
