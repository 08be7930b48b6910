//! Current history file: an ordered JSON array of workflow records

use std::path::Path;
use tracing::debug;

use super::store::HistoryEntry;
use crate::error::Result;

/// Read the history file; a missing file is an empty history
pub async fn load_history(path: &Path) -> Result<Vec<HistoryEntry>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No existing history file found");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };
    let entries: Vec<HistoryEntry> = serde_json::from_slice(&bytes)?;
    debug!(path = %path.display(), count = entries.len(), "Loaded history file");
    Ok(entries)
}

/// Rewrite the history file through a temporary file and a rename
pub async fn save_history(path: &Path, entries: &[HistoryEntry]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let payload = serde_json::to_vec_pretty(entries)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &payload).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TelemetryError;
    use crate::metrics::WorkflowProfile;

    #[tokio::test]
    async fn test_missing_file_is_empty_history() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_history(&dir.path().join("profiling_history.json")).await.unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("profiling_history.json");
        let entries: Vec<_> = ["z", "a", "m"]
            .iter()
            .enumerate()
            .map(|(i, id)| HistoryEntry {
                profile: WorkflowProfile::new(*id, i as u64),
                inserted_at: i as u64,
            })
            .collect();

        save_history(&path, &entries).await.unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(load_history(&path).await.unwrap(), entries);
    }

    #[test]
    fn test_empty_history_from_blocking_caller() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiling_history.json");
        tokio_test::block_on(save_history(&path, &[])).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[]");
        assert!(tokio_test::block_on(load_history(&path)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiling_history.json");
        std::fs::write(&path, b"[{\"promptId\": ").unwrap();
        assert!(matches!(load_history(&path).await, Err(TelemetryError::Serialization(_))));
    }
}
