// Location: src/history/archive.rs

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::persist;
use super::store::{EvictionHandler, HistoryEntry};
use crate::{
    config::ArchiveConfig,
    error::{Result, TelemetryError},
    types::{now_millis, Millis},
};

/// Metadata for one archived history batch; the payload is opaque here
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub filename: String,
    pub created: Millis,
    pub size: u64,
}

/// Secondary storage for history batches
#[async_trait]
pub trait ArchiveSink: Send + Sync {
    /// Store a batch and describe what was written
    async fn write(&self, entries: &[HistoryEntry]) -> anyhow::Result<ArchiveRecord>;

    /// All stored batches, newest first
    async fn list(&self) -> anyhow::Result<Vec<ArchiveRecord>>;

    /// `None` when no batch with that name exists
    async fn load(&self, filename: &str) -> anyhow::Result<Option<Vec<HistoryEntry>>>;

    /// `false` when no batch with that name exists
    async fn delete(&self, filename: &str) -> anyhow::Result<bool>;
}

/// Reject names that could escape the archive directory
pub fn validate_archive_name(filename: &str) -> Result<()> {
    let valid = !filename.is_empty()
        && filename.ends_with(".json")
        && !filename.contains(&['/', '\\'][..])
        && !filename.contains("..");
    if valid {
        Ok(())
    } else {
        Err(TelemetryError::InvalidArchiveName {
            filename: filename.to_string(),
        })
    }
}

fn sort_newest_first(records: &mut [ArchiveRecord]) {
    records.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| b.filename.cmp(&a.filename)));
}

fn system_time_millis(time: SystemTime) -> Millis {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Millis)
        .unwrap_or(0)
}

/// Archive batches stored as pretty-printed JSON files in one directory
#[derive(Debug)]
pub struct FileArchive {
    dir: PathBuf,
    sequence: AtomicU64,
}

impl FileArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn next_filename(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        format!("profiling_history_{}_{:06}.json", now_millis(), seq)
    }
}

#[async_trait]
impl ArchiveSink for FileArchive {
    async fn write(&self, entries: &[HistoryEntry]) -> anyhow::Result<ArchiveRecord> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating archive directory {}", self.dir.display()))?;

        let filename = self.next_filename();
        let payload = serde_json::to_vec_pretty(entries)?;
        let path = self.dir.join(&filename);
        tokio::fs::write(&path, &payload)
            .await
            .with_context(|| format!("writing archive {}", path.display()))?;

        Ok(ArchiveRecord {
            filename,
            created: now_millis(),
            size: payload.len() as u64,
        })
    }

    async fn list(&self) -> anyhow::Result<Vec<ArchiveRecord>> {
        let mut records = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(e).context("reading archive directory"),
        };

        while let Some(entry) = dir.next_entry().await? {
            let filename = entry.file_name().to_string_lossy().into_owned();
            if !filename.ends_with(".json") {
                continue;
            }
            let metadata = entry.metadata().await?;
            let created = metadata
                .created()
                .or_else(|_| metadata.modified())
                .map(system_time_millis)
                .unwrap_or(0);
            records.push(ArchiveRecord {
                filename,
                created,
                size: metadata.len(),
            });
        }

        sort_newest_first(&mut records);
        Ok(records)
    }

    async fn load(&self, filename: &str) -> anyhow::Result<Option<Vec<HistoryEntry>>> {
        let path = self.dir.join(filename);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("reading archive {}", path.display())),
        };
        let entries = serde_json::from_slice(&bytes)
            .with_context(|| format!("invalid archive format: {}", filename))?;
        Ok(Some(entries))
    }

    async fn delete(&self, filename: &str) -> anyhow::Result<bool> {
        match tokio::fs::remove_file(self.dir.join(filename)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).context("deleting archive"),
        }
    }
}

/// Archive kept in process memory, for embedders without a data directory
#[derive(Debug, Default)]
pub struct MemoryArchive {
    batches: Mutex<Vec<(ArchiveRecord, Vec<HistoryEntry>)>>,
    sequence: AtomicU64,
    failing: AtomicBool,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail, e.g. to exercise the warning path
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().len()
    }

    /// Every archived entry, in archive order
    pub fn archived_entries(&self) -> Vec<HistoryEntry> {
        self.batches
            .lock()
            .iter()
            .flat_map(|(_, entries)| entries.iter().cloned())
            .collect()
    }
}

#[async_trait]
impl ArchiveSink for MemoryArchive {
    async fn write(&self, entries: &[HistoryEntry]) -> anyhow::Result<ArchiveRecord> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("memory archive is failing writes");
        }
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let size = serde_json::to_vec(entries)?.len() as u64;
        let record = ArchiveRecord {
            filename: format!("profiling_history_{}_{:06}.json", now_millis(), seq),
            created: now_millis(),
            size,
        };
        self.batches.lock().push((record.clone(), entries.to_vec()));
        Ok(record)
    }

    async fn list(&self) -> anyhow::Result<Vec<ArchiveRecord>> {
        let mut records: Vec<_> = self.batches.lock().iter().map(|(record, _)| record.clone()).collect();
        sort_newest_first(&mut records);
        Ok(records)
    }

    async fn load(&self, filename: &str) -> anyhow::Result<Option<Vec<HistoryEntry>>> {
        Ok(self
            .batches
            .lock()
            .iter()
            .find(|(record, _)| record.filename == filename)
            .map(|(_, entries)| entries.clone()))
    }

    async fn delete(&self, filename: &str) -> anyhow::Result<bool> {
        let mut batches = self.batches.lock();
        let before = batches.len();
        batches.retain(|(record, _)| record.filename != filename);
        Ok(batches.len() != before)
    }
}

/// Counters surfaced for archive and persistence health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ArchiveStats {
    pub archived_batches: u64,
    pub archived_entries: u64,
    pub failed_writes: u64,
    pub dropped_batches: u64,
    pub persist_failures: u64,
}

#[derive(Debug, Default)]
struct ArchiveCounters {
    archived_batches: AtomicU64,
    archived_entries: AtomicU64,
    failed_writes: AtomicU64,
    dropped_batches: AtomicU64,
    persist_failures: AtomicU64,
}

impl ArchiveCounters {
    fn snapshot(&self) -> ArchiveStats {
        ArchiveStats {
            archived_batches: self.archived_batches.load(Ordering::Relaxed),
            archived_entries: self.archived_entries.load(Ordering::Relaxed),
            failed_writes: self.failed_writes.load(Ordering::Relaxed),
            dropped_batches: self.dropped_batches.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
        }
    }
}

enum WriterCommand {
    Archive(Vec<HistoryEntry>),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

struct HistorySnapshot {
    path: PathBuf,
    entries: Arc<Vec<HistoryEntry>>,
}

/// State shared between the writer handle and its task
#[derive(Default)]
struct Pending {
    /// Evicted entries not yet filling a batch
    evicted: Mutex<Vec<HistoryEntry>>,
    /// Newest history snapshot; a later save replaces an unwritten one
    snapshot: Mutex<Option<HistorySnapshot>>,
    snapshot_ready: Notify,
}

/// Write-behind worker for evicted entries and history snapshots.
///
/// Evicted entries are grouped into batches of `batch_size` before they are
/// queued; a full queue drops the batch and counts it. History snapshots
/// bypass the queue.
pub struct ArchiveWriter {
    tx: mpsc::Sender<WriterCommand>,
    sink: Option<Arc<dyn ArchiveSink>>,
    batch_size: usize,
    pending: Arc<Pending>,
    counters: Arc<ArchiveCounters>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ArchiveWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveWriter")
            .field("has_sink", &self.sink.is_some())
            .field("batch_size", &self.batch_size)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ArchiveWriter {
    /// Spawn the worker on the current tokio runtime
    pub fn spawn(sink: Option<Arc<dyn ArchiveSink>>, config: &ArchiveConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let pending = Arc::new(Pending::default());
        let counters = Arc::new(ArchiveCounters::default());
        let task = WriterTask {
            rx,
            sink: sink.clone(),
            pending: pending.clone(),
            counters: counters.clone(),
            write_timeout: config.write_timeout,
        };
        let handle = tokio::spawn(task.run());

        Self {
            tx,
            sink,
            batch_size: config.batch_size.max(1),
            pending,
            counters,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    /// Add entries to the current batch, queueing it once full.
    ///
    /// Returns whether the entries were accepted.
    pub fn submit(&self, entries: Vec<HistoryEntry>) -> bool {
        if self.sink.is_none() || entries.is_empty() {
            return false;
        }

        // Batches are queued under the lock so they stay in eviction order
        let mut evicted = self.pending.evicted.lock();
        evicted.extend(entries);
        if evicted.len() < self.batch_size {
            return true;
        }
        let batch = std::mem::take(&mut *evicted);
        let count = batch.len();
        match self.tx.try_send(WriterCommand::Archive(batch)) {
            Ok(()) => true,
            Err(e) => {
                self.counters.dropped_batches.fetch_add(1, Ordering::Relaxed);
                warn!(count, error = %e, "Archive queue unavailable, evicted workflows not archived");
                false
            }
        }
    }

    /// Schedule a rewrite of the current history file
    pub fn save_history(&self, path: PathBuf, entries: Arc<Vec<HistoryEntry>>) {
        let superseded = self
            .pending
            .snapshot
            .lock()
            .replace(HistorySnapshot { path, entries })
            .is_some();
        if superseded {
            debug!("Replaced unwritten history snapshot");
        }
        self.pending.snapshot_ready.notify_one();
    }

    /// Wait until everything handed over before this call has been written,
    /// including a partial batch
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(WriterCommand::Flush(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Write what is pending and stop the worker
    pub async fn shutdown(&self) {
        let _ = self.tx.send(WriterCommand::Shutdown).await;
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Archive writer task failed");
            }
        }
    }

    pub fn stats(&self) -> ArchiveStats {
        self.counters.snapshot()
    }
}

impl EvictionHandler for ArchiveWriter {
    fn offer(&self, evicted: &[HistoryEntry]) {
        if self.submit(evicted.to_vec()) {
            debug!(count = evicted.len(), "Collected evicted workflows for archiving");
        }
    }
}

struct WriterTask {
    rx: mpsc::Receiver<WriterCommand>,
    sink: Option<Arc<dyn ArchiveSink>>,
    pending: Arc<Pending>,
    counters: Arc<ArchiveCounters>,
    write_timeout: Duration,
}

impl WriterTask {
    async fn run(mut self) {
        let pending = self.pending.clone();
        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(WriterCommand::Archive(entries)) => self.archive(entries).await,
                    Some(WriterCommand::Flush(ack)) => {
                        self.drain().await;
                        let _ = ack.send(());
                    }
                    Some(WriterCommand::Shutdown) | None => break,
                },
                _ = pending.snapshot_ready.notified() => self.save_snapshot().await,
            }
        }
        self.drain().await;
        debug!("Archive writer stopped");
    }

    /// Write the partial batch and the latest snapshot
    async fn drain(&self) {
        let partial = std::mem::take(&mut *self.pending.evicted.lock());
        if !partial.is_empty() {
            self.archive(partial).await;
        }
        self.save_snapshot().await;
    }

    async fn archive(&self, entries: Vec<HistoryEntry>) {
        let Some(sink) = &self.sink else {
            return;
        };
        match tokio::time::timeout(self.write_timeout, sink.write(&entries)).await {
            Ok(Ok(record)) => {
                self.counters.archived_batches.fetch_add(1, Ordering::Relaxed);
                self.counters.archived_entries.fetch_add(entries.len() as u64, Ordering::Relaxed);
                debug!(filename = %record.filename, count = entries.len(), "Archived evicted workflows");
            }
            Ok(Err(e)) => {
                self.counters.failed_writes.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, count = entries.len(), "Failed to archive evicted workflows");
            }
            Err(_) => {
                self.counters.failed_writes.fetch_add(1, Ordering::Relaxed);
                warn!(timeout = ?self.write_timeout, count = entries.len(), "Archive write timed out");
            }
        }
    }

    async fn save_snapshot(&self) {
        let snapshot = self.pending.snapshot.lock().take();
        let Some(HistorySnapshot { path, entries }) = snapshot else {
            return;
        };
        match tokio::time::timeout(self.write_timeout, persist::save_history(&path, &entries)).await {
            Ok(Ok(())) => debug!(path = %path.display(), count = entries.len(), "Saved history"),
            Ok(Err(e)) => {
                self.counters.persist_failures.fetch_add(1, Ordering::Relaxed);
                error!(path = %path.display(), error = %e, "Failed to save history file");
            }
            Err(_) => {
                self.counters.persist_failures.fetch_add(1, Ordering::Relaxed);
                error!(path = %path.display(), "Saving history timed out");
            }
        }
    }
}
