//! Sidecar metadata files
//!
//! `<id>.meta.json` next to each blob holds a denormalized copy of the
//! ledger record. It is never authoritative; the reconciler reads it to
//! recover provenance for blobs that lost their ledger row.

use crate::error::{AppError, Result};
use crate::models::FileRecord;
use crate::storage::cas::atomic_write;
use crate::storage::hasher::ContentId;
use crate::storage::shard;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

pub fn sidecar_file(storage_root: &Path, id: &ContentId) -> PathBuf {
    storage_root.join(shard::sidecar_path(id))
}

/// Atomically (re)write the sidecar for `record`
pub async fn write_sidecar(storage_root: &Path, record: &FileRecord) -> Result<PathBuf> {
    let path = sidecar_file(storage_root, &record.content_id);
    let body = serde_json::to_vec_pretty(record).map_err(|e| {
        AppError::storage_error(
            format!("Failed to serialize sidecar: {}", e),
            Some(path.clone()),
        )
    })?;

    atomic_write(&path, &body).await.map_err(|e| {
        AppError::storage_error(format!("Failed to write sidecar: {}", e), Some(path.clone()))
    })?;

    debug!(hash = %record.content_id, path = %path.display(), "Sidecar written");
    Ok(path)
}

/// Read a sidecar back; `Ok(None)` when there is none
///
/// A sidecar for a different id than its file name is rejected.
pub async fn read_sidecar(storage_root: &Path, id: &ContentId) -> Result<Option<FileRecord>> {
    let path = sidecar_file(storage_root, id);
    let body = match fs::read(&path).await {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(AppError::storage_error(
                format!("Failed to read sidecar: {}", e),
                Some(path),
            ))
        }
    };

    let record: FileRecord = serde_json::from_slice(&body).map_err(|e| {
        AppError::validation_error(format!("Malformed sidecar {}: {}", path.display(), e))
    })?;

    if record.content_id != *id {
        return Err(AppError::validation_error(format!(
            "Sidecar {} describes {}",
            path.display(),
            record.content_id
        )));
    }
    Ok(Some(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Backend, FileDelta, Location, OriginalPath, SyncState};
    use crate::storage::hasher::hash_bytes;
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(id: ContentId) -> FileRecord {
        FileRecord::from_delta(
            id,
            FileDelta {
                size: 4,
                original_filename: "notes.txt".to_string(),
                file_extension: "txt".to_string(),
                original_source: "laptop".to_string(),
                original_paths: vec![OriginalPath::new("docs/notes.txt", "laptop")],
                tags: ["docs".to_string()].into_iter().collect(),
                locations: vec![Location::new(Backend::Local, "x", SyncState::Synced)],
                ..Default::default()
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let temp_dir = TempDir::new().unwrap();
        let id = hash_bytes(b"data");
        let original = record(id.clone());

        let path = write_sidecar(temp_dir.path(), &original).await.unwrap();
        assert!(path.to_string_lossy().ends_with(".meta.json"));

        let loaded = read_sidecar(temp_dir.path(), &id).await.unwrap().unwrap();
        assert_eq!(loaded, original);
    }

    #[tokio::test]
    async fn test_missing_sidecar_is_none() {
        let temp_dir = TempDir::new().unwrap();
        let id = hash_bytes(b"none");
        assert!(read_sidecar(temp_dir.path(), &id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mismatched_sidecar_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let real = hash_bytes(b"real");
        let other = hash_bytes(b"other");
        let body = serde_json::to_vec(&record(real)).unwrap();

        let path = sidecar_file(temp_dir.path(), &other);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, body).unwrap();

        assert!(read_sidecar(temp_dir.path(), &other).await.is_err());
    }
}
