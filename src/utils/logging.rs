use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Mutex, Once};
use tracing::Level;
use tracing_subscriber::{filter::LevelFilter, fmt::format::FmtSpan, EnvFilter};

use crate::config::MonitoringConfig;
use crate::error::{Result, TelemetryError};

static INIT: Once = Once::new();

/// Logging configuration options
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum log level
    pub level: Level,
    /// Whether to include source code locations
    pub source_location: bool,
    /// Whether to log span close events
    pub log_spans: bool,
    /// Output file path (None for stdout)
    pub file_path: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            source_location: false,
            log_spans: false,
            file_path: None,
        }
    }
}

impl From<&MonitoringConfig> for LogConfig {
    fn from(config: &MonitoringConfig) -> Self {
        Self {
            level: config.log_level.into(),
            ..Default::default()
        }
    }
}

/// Initialize logging system.
///
/// Only the first call installs a subscriber; later calls return `Ok`.
/// `RUST_LOG` directives override the configured level.
pub fn setup_logging(config: LogConfig) -> Result<()> {
    let mut result = Ok(());

    INIT.call_once(|| {
        result = setup_logging_internal(config);
    });

    result
}

fn setup_logging_internal(config: LogConfig) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(config.level).into())
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .with_file(config.source_location)
        .with_line_number(config.source_location)
        .with_span_events(if config.log_spans {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        });

    let installed = if let Some(path) = config.file_path {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        subscriber
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init()
    } else {
        subscriber.try_init()
    };

    installed.map_err(|e| TelemetryError::Configuration {
        message: format!("Failed to set global subscriber: {}", e),
        parameter: "logging".to_string(),
    })
}
