use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::range::Timestamped;
use crate::metrics::WorkflowProfile;
use crate::types::Millis;

/// A finalized workflow and the time it entered the history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub profile: WorkflowProfile,
    #[serde(rename = "insertedAt", default)]
    pub inserted_at: Millis,
}

impl Timestamped for HistoryEntry {
    fn start_time(&self) -> Millis {
        self.profile.start_time
    }
}

/// Receives entries as they are evicted from the history.
///
/// Called while the store still holds its write lock, so implementations
/// must hand the entries off without blocking.
pub trait EvictionHandler: Send + Sync {
    fn offer(&self, evicted: &[HistoryEntry]);
}

/// Bounded, oldest-first sequence of finalized workflows.
///
/// Readers get an `Arc` snapshot; writers mutate through `Arc::make_mut`, so
/// a reader holding a snapshot never sees a half-applied append or eviction.
pub struct HistoryStore {
    max_data_points: usize,
    entries: RwLock<Arc<Vec<HistoryEntry>>>,
    evictor: Option<Arc<dyn EvictionHandler>>,
    evicted_total: AtomicU64,
}

impl std::fmt::Debug for HistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryStore")
            .field("max_data_points", &self.max_data_points)
            .field("len", &self.len())
            .field("archiving", &self.evictor.is_some())
            .finish()
    }
}

impl HistoryStore {
    pub fn new(max_data_points: usize, evictor: Option<Arc<dyn EvictionHandler>>) -> Self {
        Self {
            max_data_points: max_data_points.max(1),
            entries: RwLock::new(Arc::new(Vec::new())),
            evictor,
            evicted_total: AtomicU64::new(0),
        }
    }

    pub fn max_data_points(&self) -> usize {
        self.max_data_points
    }

    /// Append a finalized profile, evicting the oldest entries past the bound.
    ///
    /// Returns the evicted entries, oldest first.
    pub fn append(&self, profile: WorkflowProfile, inserted_at: Millis) -> Vec<HistoryEntry> {
        let mut guard = self.entries.write();
        let entries = Arc::make_mut(&mut guard);
        entries.push(HistoryEntry { profile, inserted_at });
        self.evict_overflow(entries)
    }

    fn evict_overflow(&self, entries: &mut Vec<HistoryEntry>) -> Vec<HistoryEntry> {
        if entries.len() <= self.max_data_points {
            return Vec::new();
        }
        let excess = entries.len() - self.max_data_points;
        let evicted: Vec<HistoryEntry> = entries.drain(..excess).collect();
        self.evicted_total.fetch_add(evicted.len() as u64, Ordering::Relaxed);

        match &self.evictor {
            Some(evictor) => evictor.offer(&evicted),
            None => debug!(count = evicted.len(), "Archiving disabled, discarding evicted workflows"),
        }
        evicted
    }

    /// Replace the whole history, keeping the newest entries.
    ///
    /// Entries past the bound go through the eviction path and are returned.
    pub fn replace(&self, mut next: Vec<HistoryEntry>) -> Vec<HistoryEntry> {
        let mut guard = self.entries.write();
        let evicted = self.evict_overflow(&mut next);
        *guard = Arc::new(next);
        evicted
    }

    /// Remove and return every entry
    pub fn take_all(&self) -> Vec<HistoryEntry> {
        let mut guard = self.entries.write();
        let taken = std::mem::replace(&mut *guard, Arc::new(Vec::new()));
        Arc::try_unwrap(taken).unwrap_or_else(|shared| (*shared).clone())
    }

    /// Put previously taken entries back in front of anything appended since
    pub fn restore(&self, mut older: Vec<HistoryEntry>) -> Vec<HistoryEntry> {
        let mut guard = self.entries.write();
        older.extend(guard.iter().cloned());
        let evicted = self.evict_overflow(&mut older);
        *guard = Arc::new(older);
        evicted
    }

    pub fn latest(&self) -> Option<HistoryEntry> {
        self.entries.read().last().cloned()
    }

    /// Snapshot of the full ordered history
    pub fn all(&self) -> Arc<Vec<HistoryEntry>> {
        self.entries.read().clone()
    }

    /// The newest `count` entries, oldest first
    pub fn recent(&self, count: usize) -> Vec<HistoryEntry> {
        let entries = self.all();
        let skip = entries.len().saturating_sub(count);
        entries[skip..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn evicted_total(&self) -> u64 {
        self.evicted_total.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        *self.entries.write() = Arc::new(Vec::new());
    }
}
