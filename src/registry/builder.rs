use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info};
use crate::{
    config::TelemetryConfig,
    error::Result,
    history::{load_history, ArchiveSink, ArchiveWriter, EvictionHandler, FileArchive, HistoryStore},
    ingest::WorkflowAggregator,
    metrics::RunningAverageTracker,
    utils::ExecutionTracer,
};

use super::registry::MetricsRegistry;

/// Builder for constructing a MetricsRegistry instance
pub struct RegistryBuilder {
    config: Option<TelemetryConfig>,
    archive_sink: Option<Arc<dyn ArchiveSink>>,
}

impl RegistryBuilder {
    /// Create a new builder instance
    pub fn new() -> Self {
        Self {
            config: None,
            archive_sink: None,
        }
    }

    /// Set the registry configuration
    pub fn with_config(mut self, config: TelemetryConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use a custom archive sink instead of the file archive under `data_dir`
    pub fn with_archive_sink(mut self, sink: Arc<dyn ArchiveSink>) -> Self {
        self.archive_sink = Some(sink);
        self
    }

    /// Build the registry; must run inside a tokio runtime
    pub async fn build(self) -> Result<MetricsRegistry> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let config = Arc::new(config);

        let sink: Option<Arc<dyn ArchiveSink>> = match self.archive_sink {
            Some(sink) => Some(sink),
            None if config.archive.enabled => config
                .history
                .archive_dir()
                .map(|dir| Arc::new(FileArchive::new(dir)) as Arc<dyn ArchiveSink>),
            None => None,
        };

        // Evicted workflows only go to the sink while archiving is enabled
        let writer_sink = if config.archive.enabled { sink.clone() } else { None };
        let writer = Arc::new(ArchiveWriter::spawn(writer_sink, &config.archive));
        let evictor = if writer.has_sink() {
            Some(writer.clone() as Arc<dyn EvictionHandler>)
        } else {
            None
        };

        let history = HistoryStore::new(config.history.max_data_points, evictor);
        if config.history.persist {
            if let Some(path) = config.history.history_file() {
                match load_history(&path).await {
                    Ok(entries) => {
                        let count = entries.len();
                        history.replace(entries);
                        info!(path = %path.display(), count, "Loaded profiling history");
                    }
                    Err(e) => {
                        error!(path = %path.display(), error = %e, "Failed to load profiling history, starting empty");
                    }
                }
            }
        }

        info!(
            max_data_points = config.history.max_data_points,
            archiving = writer.has_sink(),
            persist = config.history.persist,
            tracing = config.monitoring.tracing_enabled,
            "Metrics registry initialized"
        );

        Ok(MetricsRegistry {
            tracer: ExecutionTracer::new(config.monitoring.tracing_enabled),
            aggregator: WorkflowAggregator::new(),
            tracker: RunningAverageTracker::new(),
            history,
            writer,
            sink,
            archive_lock: AsyncMutex::new(()),
            persist_lock: parking_lot::Mutex::new(()),
            config,
        })
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}
