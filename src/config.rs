// Location: src/config.rs

use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Serialize, Deserialize};
use crate::error::{Result, TelemetryError};

/// File name of the current (non-archived) history inside `data_dir`
pub const HISTORY_FILE_NAME: &str = "profiling_history.json";

/// Directory name for archived history files inside `data_dir`
pub const ARCHIVE_DIR_NAME: &str = "archives";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub history: HistoryConfig,
    pub archive: ArchiveConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Maximum number of finalized workflows retained in memory
    pub max_data_points: usize,

    /// Root directory for the history file and the archive directory
    pub data_dir: Option<PathBuf>,

    /// Whether the current history is loaded from and saved to `data_dir`
    pub persist: bool,

    /// Number of recent workflows included in combined stats
    pub stats_history_len: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Whether evicted workflows are written to the archive sink
    pub enabled: bool,

    /// Evicted workflows collected into one archive
    pub batch_size: usize,

    /// Capacity of the write-behind queue, in batches
    pub queue_capacity: usize,

    /// Upper bound for a single archive write
    pub write_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Whether the method-call tracer records anything
    pub tracing_enabled: bool,

    /// Log level
    pub log_level: LogLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_data_points: 10_000,
            data_dir: None,
            persist: false,
            stats_history_len: 10,
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 500,
            queue_capacity: 64,
            write_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            tracing_enabled: false,
            log_level: LogLevel::Info,
        }
    }
}

impl HistoryConfig {
    pub fn history_file(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(HISTORY_FILE_NAME))
    }

    pub fn archive_dir(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|dir| dir.join(ARCHIVE_DIR_NAME))
    }
}

impl TelemetryConfig {
    /// Load a configuration from a JSON file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: TelemetryConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.history.max_data_points == 0 {
            return Err(TelemetryError::Configuration {
                message: "Maximum data points must be greater than zero".to_string(),
                parameter: "max_data_points".to_string(),
            });
        }

        if self.history.persist && self.history.data_dir.is_none() {
            return Err(TelemetryError::Configuration {
                message: "A data directory is required when persistence is enabled".to_string(),
                parameter: "data_dir".to_string(),
            });
        }

        if self.archive.batch_size == 0 {
            return Err(TelemetryError::Configuration {
                message: "Archive batch size must be greater than zero".to_string(),
                parameter: "batch_size".to_string(),
            });
        }

        if self.archive.queue_capacity == 0 {
            return Err(TelemetryError::Configuration {
                message: "Archive queue capacity must be greater than zero".to_string(),
                parameter: "queue_capacity".to_string(),
            });
        }

        if self.archive.write_timeout.is_zero() {
            return Err(TelemetryError::Configuration {
                message: "Archive write timeout cannot be zero".to_string(),
                parameter: "write_timeout".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TelemetryConfig::default();
        assert_eq!(config.history.max_data_points, 10_000);
        assert_eq!(config.history.stats_history_len, 10);
        assert!(config.archive.enabled);
        assert!(!config.monitoring.tracing_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = TelemetryConfig::default();
        config.history.max_data_points = 0;
        assert!(config.validate().is_err());

        let mut config = TelemetryConfig::default();
        config.history.persist = true;
        assert!(config.validate().is_err());
        config.history.data_dir = Some(PathBuf::from("/tmp/telemetry"));
        assert!(config.validate().is_ok());

        let mut config = TelemetryConfig::default();
        config.archive.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = TelemetryConfig::default();
        config.archive.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry.json");
        std::fs::write(&path, r#"{"history": {"max_data_points": 25}}"#).unwrap();

        let config = TelemetryConfig::from_file(&path).unwrap();
        assert_eq!(config.history.max_data_points, 25);
        assert_eq!(config.history.stats_history_len, 10);
        assert_eq!(config.archive.queue_capacity, 64);
        assert_eq!(config.archive.batch_size, 500);
    }

    #[test]
    fn test_data_paths() {
        let mut config = HistoryConfig::default();
        assert!(config.history_file().is_none());

        config.data_dir = Some(PathBuf::from("/var/telemetry"));
        assert_eq!(
            config.history_file().unwrap(),
            PathBuf::from("/var/telemetry/profiling_history.json")
        );
        assert_eq!(config.archive_dir().unwrap(), PathBuf::from("/var/telemetry/archives"));
    }
}
