//! Bounded workflow history, time-range queries and archiving

mod archive;
mod persist;
mod range;
mod store;

pub use archive::{
    validate_archive_name,
    ArchiveRecord,
    ArchiveSink,
    ArchiveStats,
    ArchiveWriter,
    FileArchive,
    MemoryArchive,
};
pub use persist::{load_history, save_history};
pub use range::{filter_by_range, filter_by_time_range, TimeRange, Timestamped};
pub use store::{EvictionHandler, HistoryEntry, HistoryStore};
