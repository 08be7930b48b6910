use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use crate::{
    config::TelemetryConfig,
    error::{Result, TelemetryError},
    history::{
        filter_by_range, validate_archive_name, ArchiveRecord, ArchiveSink, ArchiveStats, ArchiveWriter,
        HistoryEntry, HistoryStore,
    },
    ingest::WorkflowAggregator,
    metrics::{IngestStats, NodeAverages, RunningAverageTracker, WorkflowAverages, WorkflowProfile},
    types::{now_millis, EventKind, IngestOutcome, Millis, NodeEvent, SamplePhase},
    utils::{ExecutionTracer, MethodStats},
};

use super::builder::RegistryBuilder;
use super::ProfilingHooks;

/// Combined view for dashboards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryStats {
    /// Workflows still in flight, oldest first
    pub current: Vec<WorkflowProfile>,
    pub latest: Option<WorkflowProfile>,
    pub node_averages: BTreeMap<String, NodeAverages>,
    pub workflow_averages: WorkflowAverages,
    /// The most recent finalized workflows, oldest first
    pub history: Vec<WorkflowProfile>,
    pub ingest: IngestStats,
    pub archive: ArchiveStats,
    /// Empty unless the tracer is enabled
    pub method_stats: HashMap<String, MethodStats>,
}

/// Main entry point for the telemetry pipeline.
///
/// One instance holds all profiling state for a process. Ingest calls are
/// synchronous and never wait on I/O; archive management is async.
pub struct MetricsRegistry {
    pub(super) config: Arc<TelemetryConfig>,
    pub(super) aggregator: WorkflowAggregator,
    pub(super) tracker: RunningAverageTracker,
    pub(super) history: HistoryStore,
    pub(super) writer: Arc<ArchiveWriter>,
    pub(super) sink: Option<Arc<dyn ArchiveSink>>,
    pub(super) tracer: ExecutionTracer,
    /// Serializes archive, load and delete against each other
    pub(super) archive_lock: AsyncMutex<()>,
    /// Keeps persisted snapshots queued in the order they were taken
    pub(super) persist_lock: parking_lot::Mutex<()>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("in_flight", &self.aggregator.in_flight_count())
            .field("history", &self.history)
            .field("writer", &self.writer)
            .field("tracer", &self.tracer.is_enabled())
            .finish()
    }
}

impl MetricsRegistry {
    /// Create a new registry builder
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Build a registry from a configuration
    pub async fn init(config: TelemetryConfig) -> Result<Self> {
        RegistryBuilder::new().with_config(config).build().await
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    pub fn tracer(&self) -> &ExecutionTracer {
        &self.tracer
    }

    /// Drop all in-memory state and start over
    pub fn reset(&self) {
        self.aggregator.reset();
        self.tracker.reset();
        self.history.clear();
        self.tracer.reset();
        self.persist();
        info!("Metrics registry reset");
    }

    /// Wait for queued archive and persistence writes
    pub async fn flush(&self) {
        self.writer.flush().await;
    }

    /// Persist the current history and stop the background writer
    pub async fn shutdown(&self) {
        self.persist();
        self.writer.shutdown().await;
        info!(
            in_flight = self.aggregator.in_flight_count(),
            history = self.history.len(),
            "Metrics registry shut down"
        );
    }

    // Ingest

    pub fn handle_event(&self, event: &NodeEvent) -> Result<IngestOutcome> {
        let mut guard = self.tracer.trace("MetricsRegistry.handle_event").for_prompt(&event.prompt_id);
        if event.kind == EventKind::CacheResolved {
            guard.mark_cache_hit(event.cache_hit == Some(true));
        }
        let result = self.aggregator.apply(event);
        self.begin_execution(&event.prompt_id, event.timestamp, &result);
        result
    }

    pub fn on_workflow_start(&self, prompt_id: &str, timestamp: Millis) -> Result<IngestOutcome> {
        let result = self.aggregator.on_workflow_start(prompt_id, timestamp);
        self.begin_execution(prompt_id, timestamp, &result);
        result
    }

    pub fn on_node_start(
        &self,
        prompt_id: &str,
        node_id: &str,
        node_type: &str,
        timestamp: Millis,
    ) -> Result<IngestOutcome> {
        let _guard = self.tracer.trace("MetricsRegistry.on_node_start").for_prompt(prompt_id);
        let result = self.aggregator.on_node_start(prompt_id, node_id, node_type, timestamp);
        self.begin_execution(prompt_id, timestamp, &result);
        result
    }

    pub fn on_node_end(
        &self,
        prompt_id: &str,
        node_id: &str,
        timestamp: Millis,
        vram_after: u64,
        ram_after: u64,
        error: Option<String>,
    ) -> Result<IngestOutcome> {
        let _guard = self.tracer.trace("MetricsRegistry.on_node_end").for_prompt(prompt_id);
        self.aggregator
            .on_node_end(prompt_id, node_id, timestamp, vram_after, ram_after, error)
    }

    pub fn on_cache_resolved(&self, prompt_id: &str, node_id: &str, hit: bool) -> Result<IngestOutcome> {
        let mut guard = self.tracer.trace("MetricsRegistry.on_cache_resolved").for_prompt(prompt_id);
        guard.mark_cache_hit(hit);
        self.aggregator.on_cache_resolved(prompt_id, node_id, hit)
    }

    pub fn on_vram_sample(
        &self,
        prompt_id: &str,
        node_id: &str,
        phase: SamplePhase,
        bytes: u64,
    ) -> Result<IngestOutcome> {
        self.aggregator.on_vram_sample(prompt_id, node_id, phase, bytes)
    }

    pub fn on_ram_sample(
        &self,
        prompt_id: &str,
        node_id: &str,
        phase: SamplePhase,
        bytes: u64,
    ) -> Result<IngestOutcome> {
        self.aggregator.on_ram_sample(prompt_id, node_id, phase, bytes)
    }

    pub fn record_error(&self, prompt_id: &str, node_id: &str, message: &str) -> Result<IngestOutcome> {
        self.aggregator.record_error(prompt_id, node_id, message)
    }

    /// Close a workflow, fold it into the averages and append it to history
    pub fn finalize(&self, prompt_id: &str, end_time: Millis) -> Result<WorkflowProfile> {
        let guard = self.tracer.trace("MetricsRegistry.finalize").for_prompt(prompt_id);
        let profile = self.aggregator.finalize(prompt_id, end_time)?;

        self.tracker.fold(&profile);
        let evicted = self.history.append(profile.clone(), now_millis());
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Evicted workflows from history");
        }
        self.persist();

        drop(guard);
        self.tracer.end_execution(prompt_id, end_time);
        Ok(profile)
    }

    fn begin_execution(&self, prompt_id: &str, timestamp: Millis, result: &Result<IngestOutcome>) {
        if matches!(result, Ok(IngestOutcome::Created)) {
            self.tracer.start_execution(prompt_id, timestamp);
        }
    }

    // Queries

    pub fn get_latest(&self) -> Option<WorkflowProfile> {
        self.history.latest().map(|entry| entry.profile)
    }

    /// Finalized workflows started inside the range, oldest first
    pub fn get_history(&self, range: &str) -> Vec<WorkflowProfile> {
        self.get_history_at(range, now_millis())
    }

    pub fn get_history_at(&self, range: &str, now: Millis) -> Vec<WorkflowProfile> {
        let entries = self.history.all();
        filter_by_range(&entries, range, now)
            .iter()
            .map(|entry| entry.profile.clone())
            .collect()
    }

    pub fn get_node_averages(&self) -> BTreeMap<String, NodeAverages> {
        self.tracker.node_averages()
    }

    pub fn get_workflow_averages(&self) -> WorkflowAverages {
        self.tracker.workflow_averages()
    }

    /// In-flight workflows, oldest first
    pub fn get_current(&self) -> Vec<WorkflowProfile> {
        self.aggregator.snapshot()
    }

    /// Archived batches, newest first; empty when archives cannot be read
    pub async fn list_archives(&self) -> Vec<ArchiveRecord> {
        let Some(sink) = &self.sink else {
            return Vec::new();
        };
        match self.bounded("list", sink.list()).await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Failed to list archives");
                Vec::new()
            }
        }
    }

    pub fn get_stats(&self) -> TelemetryStats {
        let history_len = self.config.history.stats_history_len;
        TelemetryStats {
            current: self.aggregator.snapshot(),
            latest: self.get_latest(),
            node_averages: self.tracker.node_averages(),
            workflow_averages: self.tracker.workflow_averages(),
            history: self
                .history
                .recent(history_len)
                .into_iter()
                .map(|entry| entry.profile)
                .collect(),
            ingest: self.aggregator.stats(),
            archive: self.writer.stats(),
            method_stats: self.tracer.method_stats(),
        }
    }

    pub fn ingest_stats(&self) -> IngestStats {
        self.aggregator.stats()
    }

    pub fn archive_stats(&self) -> ArchiveStats {
        self.writer.stats()
    }

    // Archive management

    /// Move the whole current history into a new archive.
    ///
    /// Returns `None` when there was nothing to archive. On failure the
    /// history is put back as it was.
    pub async fn archive_history(&self) -> Result<Option<ArchiveRecord>> {
        let sink = self.require_sink()?;
        let _lock = self.archive_lock.lock().await;

        let entries = self.history.take_all();
        if entries.is_empty() {
            return Ok(None);
        }

        match self.write_archive(sink, &entries).await {
            Ok(record) => {
                self.persist();
                info!(filename = %record.filename, count = entries.len(), "Archived profiling history");
                Ok(Some(record))
            }
            Err(e) => {
                self.history.restore(entries);
                Err(e)
            }
        }
    }

    /// Replace the current history with an archive's contents.
    ///
    /// The current history is archived first, the newest entries of the
    /// archive are kept and the archive itself is removed. Returns the
    /// resulting history length.
    pub async fn load_archive(&self, filename: &str) -> Result<usize> {
        validate_archive_name(filename)?;
        let sink = self.require_sink()?;
        let _lock = self.archive_lock.lock().await;

        let loaded = match self.bounded("load", sink.load(filename)).await? {
            Some(entries) => entries,
            None => {
                return Err(TelemetryError::ArchiveNotFound {
                    filename: filename.to_string(),
                })
            }
        };

        let current = self.history.take_all();
        if !current.is_empty() {
            if let Err(e) = self.write_archive(sink, &current).await {
                self.history.restore(current);
                return Err(e);
            }
        }

        let count = loaded.len();
        // Workflows finalized while the archive was loading stay newest
        self.history.restore(loaded);

        match self.bounded("delete", sink.delete(filename)).await {
            Ok(_) => {}
            Err(e) => warn!(%filename, error = %e, "Loaded archive could not be removed"),
        }
        self.persist();

        info!(%filename, count, kept = self.history.len(), "Loaded archived history");
        Ok(self.history.len())
    }

    pub async fn delete_archive(&self, filename: &str) -> Result<()> {
        validate_archive_name(filename)?;
        let sink = self.require_sink()?;
        let _lock = self.archive_lock.lock().await;

        if self.bounded("delete", sink.delete(filename)).await? {
            info!(%filename, "Deleted archive");
            Ok(())
        } else {
            Err(TelemetryError::ArchiveNotFound {
                filename: filename.to_string(),
            })
        }
    }

    fn require_sink(&self) -> Result<&Arc<dyn ArchiveSink>> {
        self.sink.as_ref().ok_or_else(|| TelemetryError::Configuration {
            message: "No archive sink configured".to_string(),
            parameter: "archive".to_string(),
        })
    }

    async fn write_archive(&self, sink: &Arc<dyn ArchiveSink>, entries: &[HistoryEntry]) -> Result<ArchiveRecord> {
        self.bounded("write", sink.write(entries)).await
    }

    /// Run one sink operation under the configured write timeout
    async fn bounded<T, F>(&self, operation: &str, future: F) -> Result<T>
    where
        F: std::future::Future<Output = anyhow::Result<T>>,
    {
        let duration: Duration = self.config.archive.write_timeout;
        match tokio::time::timeout(duration, future).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(TelemetryError::ArchiveWrite {
                message: format!("{} failed: {:#}", operation, e),
            }),
            Err(_) => Err(TelemetryError::ArchiveTimeout {
                duration,
                operation: operation.to_string(),
            }),
        }
    }

    fn persist(&self) {
        if !self.config.history.persist {
            return;
        }
        let Some(path) = self.config.history.history_file() else {
            return;
        };
        let _lock = self.persist_lock.lock();
        self.writer.save_history(path, self.history.all());
    }
}

impl ProfilingHooks for MetricsRegistry {
    fn handle_event(&self, event: &NodeEvent) -> Result<IngestOutcome> {
        MetricsRegistry::handle_event(self, event)
    }

    fn on_workflow_start(&self, prompt_id: &str, timestamp: Millis) -> Result<IngestOutcome> {
        MetricsRegistry::on_workflow_start(self, prompt_id, timestamp)
    }

    fn on_node_start(&self, prompt_id: &str, node_id: &str, node_type: &str, timestamp: Millis)
        -> Result<IngestOutcome>
    {
        MetricsRegistry::on_node_start(self, prompt_id, node_id, node_type, timestamp)
    }

    fn on_node_end(
        &self,
        prompt_id: &str,
        node_id: &str,
        timestamp: Millis,
        vram_after: u64,
        ram_after: u64,
        error: Option<String>,
    ) -> Result<IngestOutcome> {
        MetricsRegistry::on_node_end(self, prompt_id, node_id, timestamp, vram_after, ram_after, error)
    }

    fn on_cache_resolved(&self, prompt_id: &str, node_id: &str, hit: bool) -> Result<IngestOutcome> {
        MetricsRegistry::on_cache_resolved(self, prompt_id, node_id, hit)
    }

    fn on_vram_sample(&self, prompt_id: &str, node_id: &str, phase: SamplePhase, bytes: u64)
        -> Result<IngestOutcome>
    {
        MetricsRegistry::on_vram_sample(self, prompt_id, node_id, phase, bytes)
    }

    fn on_ram_sample(&self, prompt_id: &str, node_id: &str, phase: SamplePhase, bytes: u64)
        -> Result<IngestOutcome>
    {
        MetricsRegistry::on_ram_sample(self, prompt_id, node_id, phase, bytes)
    }

    fn record_error(&self, prompt_id: &str, node_id: &str, message: &str) -> Result<IngestOutcome> {
        MetricsRegistry::record_error(self, prompt_id, node_id, message)
    }

    fn on_workflow_end(&self, prompt_id: &str, end_time: Millis) -> Result<WorkflowProfile> {
        self.finalize(prompt_id, end_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HISTORY_FILE_NAME;
    use crate::history::{load_history, MemoryArchive};

    async fn registry_with(config: TelemetryConfig, sink: Option<Arc<MemoryArchive>>) -> MetricsRegistry {
        let mut builder = MetricsRegistry::builder().with_config(config);
        if let Some(sink) = sink {
            builder = builder.with_archive_sink(sink);
        }
        builder.build().await.unwrap()
    }

    fn run(registry: &MetricsRegistry, prompt_id: &str, start: Millis, duration: Millis) -> WorkflowProfile {
        registry.on_node_start(prompt_id, "n1", "KSampler", start).unwrap();
        registry
            .on_node_end(prompt_id, "n1", start + duration, 2000, 500, None)
            .unwrap();
        registry.on_cache_resolved(prompt_id, "n1", false).unwrap();
        registry.finalize(prompt_id, start + duration).unwrap()
    }

    fn ids(profiles: &[WorkflowProfile]) -> Vec<String> {
        profiles.iter().map(|p| p.prompt_id.clone()).collect()
    }

    #[tokio::test]
    async fn test_finalize_feeds_history_and_averages() {
        let registry = registry_with(TelemetryConfig::default(), None).await;
        run(&registry, "p1", 0, 100);
        run(&registry, "p2", 200, 300);

        assert_eq!(registry.get_latest().unwrap().prompt_id, "p2");
        assert_eq!(ids(&registry.get_history("all")), vec!["p1", "p2"]);

        let node = registry.get_node_averages()["KSampler"];
        assert_eq!(node.count, 2);
        assert_eq!(node.avg_time, 200.0);
        assert_eq!(node.cache_hit_ratio, 0.0);

        let workflow = registry.get_workflow_averages();
        assert_eq!(workflow.count, 2);
        assert_eq!(workflow.avg_vram_peak, 2000.0);
    }

    #[tokio::test]
    async fn test_event_errors_are_surfaced_and_counted() {
        let registry = registry_with(TelemetryConfig::default(), None).await;
        let dangling = registry.handle_event(&NodeEvent::end("p1", "ghost", 5));
        assert!(matches!(dangling, Err(TelemetryError::UnknownWorkflow { .. })));

        assert!(matches!(
            registry.finalize("nope", 10),
            Err(TelemetryError::UnknownWorkflow { .. })
        ));

        registry.on_node_start("p1", "n1", "KSampler", 0).unwrap();
        assert!(matches!(
            registry.on_node_end("p1", "n2", 5, 0, 0, None),
            Err(TelemetryError::DanglingNode { .. })
        ));

        let stats = registry.ingest_stats();
        assert_eq!(stats.unknown_workflows, 2);
        assert_eq!(stats.dangling_nodes, 1);
        assert!(registry.get_history("all").is_empty());
    }

    #[tokio::test]
    async fn test_unknown_range_is_empty_not_error() {
        let registry = registry_with(TelemetryConfig::default(), None).await;
        run(&registry, "p1", 0, 10);
        assert!(registry.get_history_at("3d", 100).is_empty());
        assert_eq!(registry.get_history_at("all", 100).len(), 1);
    }

    #[tokio::test]
    async fn test_eviction_goes_to_archive() {
        let mut config = TelemetryConfig::default();
        config.history.max_data_points = 2;
        let sink = Arc::new(MemoryArchive::new());
        let registry = registry_with(config, Some(sink.clone())).await;

        for (i, prompt_id) in ["a", "b", "c", "d"].iter().enumerate() {
            run(&registry, prompt_id, i as Millis * 10, 5);
        }
        registry.flush().await;

        assert_eq!(ids(&registry.get_history("all")), vec!["c", "d"]);
        let archived: Vec<_> = sink
            .archived_entries()
            .into_iter()
            .map(|entry| entry.profile.prompt_id)
            .collect();
        assert_eq!(archived, vec!["a", "b"]);
        assert_eq!(registry.archive_stats().archived_entries, 2);
    }

    #[tokio::test]
    async fn test_disabled_archiving_keeps_bound_without_sink_writes() {
        let mut config = TelemetryConfig::default();
        config.history.max_data_points = 1;
        config.archive.enabled = false;
        let sink = Arc::new(MemoryArchive::new());
        let registry = registry_with(config, Some(sink.clone())).await;

        run(&registry, "a", 0, 1);
        run(&registry, "b", 10, 1);
        registry.flush().await;

        assert_eq!(ids(&registry.get_history("all")), vec!["b"]);
        assert_eq!(sink.batch_count(), 0);
    }

    #[tokio::test]
    async fn test_archive_and_load_cycle() {
        let sink = Arc::new(MemoryArchive::new());
        let registry = registry_with(TelemetryConfig::default(), Some(sink.clone())).await;

        assert!(registry.archive_history().await.unwrap().is_none());

        run(&registry, "a", 0, 1);
        run(&registry, "b", 10, 1);
        let record = registry.archive_history().await.unwrap().unwrap();
        assert!(registry.get_history("all").is_empty());
        assert_eq!(registry.list_archives().await.len(), 1);

        run(&registry, "c", 20, 1);
        let kept = registry.load_archive(&record.filename).await.unwrap();
        assert_eq!(kept, 2);
        assert_eq!(ids(&registry.get_history("all")), vec!["a", "b"]);

        // "c" was archived before the load; the loaded archive is gone
        let archives = registry.list_archives().await;
        assert_eq!(archives.len(), 1);
        assert_ne!(archives[0].filename, record.filename);
    }

    #[tokio::test]
    async fn test_failed_archive_restores_history() {
        let sink = Arc::new(MemoryArchive::new());
        let registry = registry_with(TelemetryConfig::default(), Some(sink.clone())).await;
        run(&registry, "a", 0, 1);

        sink.set_failing(true);
        let result = registry.archive_history().await;
        assert!(matches!(result, Err(TelemetryError::ArchiveWrite { .. })));
        assert_eq!(ids(&registry.get_history("all")), vec!["a"]);
    }

    /// Sink whose writes outlast any reasonable timeout
    #[derive(Debug, Default)]
    struct SlowArchive;

    #[async_trait::async_trait]
    impl ArchiveSink for SlowArchive {
        async fn write(&self, entries: &[HistoryEntry]) -> anyhow::Result<ArchiveRecord> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(ArchiveRecord {
                filename: "slow.json".to_string(),
                created: now_millis(),
                size: entries.len() as u64,
            })
        }

        async fn list(&self) -> anyhow::Result<Vec<ArchiveRecord>> {
            Ok(Vec::new())
        }

        async fn load(&self, _filename: &str) -> anyhow::Result<Option<Vec<HistoryEntry>>> {
            Ok(None)
        }

        async fn delete(&self, _filename: &str) -> anyhow::Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_slow_sink_times_out_without_stalling_ingest() {
        let mut config = TelemetryConfig::default();
        config.history.max_data_points = 1;
        config.archive.batch_size = 1;
        config.archive.write_timeout = Duration::from_millis(20);
        let registry = MetricsRegistry::builder()
            .with_config(config)
            .with_archive_sink(Arc::new(SlowArchive))
            .build()
            .await
            .unwrap();

        let started = std::time::Instant::now();
        run(&registry, "a", 0, 1);
        run(&registry, "b", 10, 1);
        run(&registry, "c", 20, 1);
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(ids(&registry.get_history("all")), vec!["c"]);

        registry.flush().await;
        assert_eq!(registry.archive_stats().failed_writes, 2);
        assert_eq!(registry.archive_stats().archived_entries, 0);

        let result = registry.archive_history().await;
        match result {
            Err(TelemetryError::ArchiveTimeout { duration, operation }) => {
                assert_eq!(duration, Duration::from_millis(20));
                assert_eq!(operation, "write");
            }
            other => panic!("expected a timeout, got {:?}", other),
        }
        assert_eq!(ids(&registry.get_history("all")), vec!["c"]);
    }

    #[tokio::test]
    async fn test_archive_names_are_validated() {
        let sink = Arc::new(MemoryArchive::new());
        let registry = registry_with(TelemetryConfig::default(), Some(sink)).await;

        assert!(matches!(
            registry.load_archive("../etc/passwd.json").await,
            Err(TelemetryError::InvalidArchiveName { .. })
        ));
        assert!(matches!(
            registry.delete_archive("missing.json").await,
            Err(TelemetryError::ArchiveNotFound { .. })
        ));
        assert!(matches!(
            registry.load_archive("missing.json").await,
            Err(TelemetryError::ArchiveNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_archive_management_without_sink() {
        let registry = registry_with(TelemetryConfig::default(), None).await;
        assert!(registry.list_archives().await.is_empty());
        assert!(matches!(
            registry.archive_history().await,
            Err(TelemetryError::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn test_history_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = TelemetryConfig::default();
        config.history.data_dir = Some(dir.path().to_path_buf());
        config.history.persist = true;

        let registry = MetricsRegistry::init(config.clone()).await.unwrap();
        run(&registry, "p1", 0, 10);
        registry.shutdown().await;

        let saved = load_history(&dir.path().join(HISTORY_FILE_NAME)).await.unwrap();
        assert_eq!(saved.len(), 1);

        let reloaded = MetricsRegistry::init(config).await.unwrap();
        assert_eq!(reloaded.get_latest().unwrap().prompt_id, "p1");
        // Averages are not persisted
        assert_eq!(reloaded.get_workflow_averages().count, 0);
    }

    #[tokio::test]
    async fn test_stats_and_reset() {
        let mut config = TelemetryConfig::default();
        config.history.stats_history_len = 2;
        let registry = registry_with(config, None).await;

        for (i, prompt_id) in ["a", "b", "c"].iter().enumerate() {
            run(&registry, prompt_id, i as Millis * 10, 5);
        }
        registry.on_node_start("live", "n1", "VAEDecode", 100).unwrap();

        let stats = registry.get_stats();
        assert_eq!(ids(&stats.current), vec!["live"]);
        assert_eq!(ids(&stats.history), vec!["b", "c"]);
        assert_eq!(stats.latest.unwrap().prompt_id, "c");
        assert_eq!(stats.node_averages["KSampler"].count, 3);
        assert!(stats.method_stats.is_empty());

        registry.reset();
        let stats = registry.get_stats();
        assert!(stats.current.is_empty());
        assert!(stats.history.is_empty());
        assert!(stats.node_averages.is_empty());
        assert_eq!(stats.ingest, IngestStats::default());
    }

    #[tokio::test]
    async fn test_tracer_follows_workflow_lifecycle() {
        let mut config = TelemetryConfig::default();
        config.monitoring.tracing_enabled = true;
        let registry = registry_with(config, None).await;

        registry.handle_event(&NodeEvent::start("p1", "n1", "KSampler", 0)).unwrap();
        registry.handle_event(&NodeEvent::end("p1", "n1", 40)).unwrap();
        registry
            .handle_event(&NodeEvent::cache_resolved("p1", "n1", true, 40))
            .unwrap();
        registry.finalize("p1", 50).unwrap();

        let executions = registry.tracer().executions();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].prompt_id, "p1");
        assert_eq!(executions[0].total_time, 50.0);
        assert_eq!(executions[0].method_calls.len(), 4);
        assert_eq!(executions[0].method_calls[3].method, "MetricsRegistry.finalize");
        assert!(executions[0].method_calls[2].is_cache_hit);

        let stats = registry.get_stats().method_stats;
        assert_eq!(stats["MetricsRegistry.handle_event"].total_calls, 3);
        assert_eq!(stats["MetricsRegistry.finalize"].total_calls, 1);
    }
}
