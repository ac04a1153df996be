//! Local Content-Addressable Storage
//!
//! Blobs live under `<root>/<id[0:2]>/<id[2:4]>/<id>` (see [`crate::storage::shard`]).
//!
//! ## Write discipline
//!
//! 1. Bytes are copied into `.<id>.<uuid>.tmp` inside the target shard
//!    directory, hashing as they go.
//! 2. The temp file is synced and its digest compared with the expected id.
//! 3. On a match it is renamed over the final path; on a mismatch (or any
//!    error) it is removed and never promoted.
//!
//! A reader therefore never sees a partial blob at a final path. Two writers
//! racing on the same id both end in a complete, identical file.

use crate::error::{AppError, Result};
use crate::models::Backend;
use crate::storage::backend::{BlobBackend, PutOutcome};
use crate::storage::hasher::{hash_and_copy, hash_file, ContentId};
use crate::storage::shard::{self, TEMP_SUFFIX};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// Directory (under the storage root) that holds spooled input streams
pub const STAGING_DIR: &str = ".staging";

/// A stream spooled to disk and hashed, not yet placed in the store
///
/// The spool file is deleted when this value is dropped unless it was
/// promoted by [`LocalBlobStore::put_staged`].
#[derive(Debug)]
pub struct StagedBlob {
    pub content_id: ContentId,
    pub size: u64,
    path: tempfile::TempPath,
}

impl StagedBlob {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Local blob store
///
/// Uses an in-memory `DashSet` to skip filesystem probes for ids known to be
/// present. Only confirmed-present ids are cached; [`LocalBlobStore::probe`]
/// bypasses the cache and evicts ids whose blob has disappeared.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
    existence_cache: Arc<DashSet<ContentId>>,
}

impl LocalBlobStore {
    /// Create a store rooted at `root` (typically `<vault>/storage`)
    ///
    /// Nothing is created on disk until the first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            existence_cache: Arc::new(DashSet::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blob_path(&self, id: &ContentId) -> PathBuf {
        self.root.join(shard::shard_path(id))
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// Store the contents of a file under `id`
    ///
    /// The file is re-hashed while it is copied; if it no longer hashes to
    /// `id` (modified since it was hashed, or a bad read) the write fails
    /// with [`AppError::Corruption`].
    pub async fn put_file(&self, id: &ContentId, src: &Path) -> Result<PutOutcome> {
        if self.is_cached_present(id).await {
            return Ok(PutOutcome::AlreadyExists);
        }

        let file = fs::File::open(src).await.map_err(|e| {
            AppError::read_error(
                format!("Failed to open source file: {}", e),
                Some(src.to_path_buf()),
            )
        })?;

        self.put_reader(id, file).await.map_err(|e| match e {
            AppError::Read { message, path: None } => AppError::Read {
                message,
                path: Some(src.to_path_buf()),
            },
            other => other,
        })
    }

    /// Store a reader's bytes under `id`
    pub async fn put_reader<R>(&self, id: &ContentId, reader: R) -> Result<PutOutcome>
    where
        R: AsyncRead + Unpin + Send,
    {
        if self.is_cached_present(id).await {
            return Ok(PutOutcome::AlreadyExists);
        }

        let final_path = self.blob_path(id);
        let shard_dir = self.ensure_shard_dir(id).await?;

        let temp_path = shard_dir.join(format!(
            ".{}.{}{}",
            id,
            Uuid::new_v4().simple(),
            TEMP_SUFFIX
        ));
        // Removes the temp file on every early return below
        let cleanup = scopeguard::guard(temp_path.clone(), |path| {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to remove temp blob");
                }
            }
        });

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await
            .map_err(|e| {
                AppError::storage_error(
                    format!("Failed to create temp blob: {}", e),
                    Some(temp_path.clone()),
                )
            })?;

        let (actual, size) = hash_and_copy(reader, &mut file)
            .await
            .map_err(|e| with_storage_path(e, &temp_path))?;

        file.sync_all().await.map_err(|e| {
            AppError::storage_error(
                format!("Failed to sync temp blob: {}", e),
                Some(temp_path.clone()),
            )
        })?;
        drop(file);

        if actual != *id {
            warn!(
                expected = %id,
                actual = %actual,
                "Written bytes do not match content id, discarding temp blob"
            );
            return Err(AppError::corruption(id.as_str(), actual.as_str()));
        }

        self.publish(id, &temp_path, &final_path, size, cleanup).await
    }

    /// Spool a stream into the staging directory while hashing it
    pub async fn stage_reader<R>(&self, reader: R) -> Result<StagedBlob>
    where
        R: AsyncRead + Unpin + Send,
    {
        let staging = self.staging_dir();
        fs::create_dir_all(&staging).await.map_err(|e| {
            AppError::storage_error(
                format!("Failed to create staging directory: {}", e),
                Some(staging.clone()),
            )
        })?;

        let named = tempfile::Builder::new()
            .prefix(".stage-")
            .suffix(TEMP_SUFFIX)
            .tempfile_in(&staging)
            .map_err(|e| {
                AppError::storage_error(
                    format!("Failed to create staging file: {}", e),
                    Some(staging.clone()),
                )
            })?;
        let (std_file, path) = named.into_parts();
        let mut file = fs::File::from_std(std_file);

        let (content_id, size) = hash_and_copy(reader, &mut file)
            .await
            .map_err(|e| with_storage_path(e, &path))?;
        file.sync_all().await.map_err(|e| {
            AppError::storage_error(
                format!("Failed to sync staging file: {}", e),
                Some(path.to_path_buf()),
            )
        })?;

        debug!(hash = %content_id, size = size, "Stream spooled to staging");

        Ok(StagedBlob {
            content_id,
            size,
            path,
        })
    }

    /// Promote a staged spool file into the store
    ///
    /// The spool is re-hashed before the rename. A staged blob whose id is
    /// already stored is simply dropped.
    pub async fn put_staged(&self, staged: StagedBlob) -> Result<PutOutcome> {
        let id = staged.content_id.clone();
        if self.is_cached_present(&id).await {
            return Ok(PutOutcome::AlreadyExists);
        }

        let (actual, size) = hash_file(staged.path()).await.map_err(|e| {
            AppError::storage_error(
                format!("Failed to re-hash staged blob: {}", e),
                Some(staged.path().to_path_buf()),
            )
        })?;
        if actual != id {
            warn!(expected = %id, actual = %actual, "Staged blob changed on disk, discarding");
            return Err(AppError::corruption(id.as_str(), actual.as_str()));
        }

        self.ensure_shard_dir(&id).await?;
        let final_path = self.blob_path(&id);

        if path_exists(&final_path).await? {
            self.existence_cache.insert(id);
            return Ok(PutOutcome::AlreadyExists);
        }

        staged.path.persist(&final_path).map_err(|e| {
            AppError::storage_error(
                format!("Failed to move staged blob into place: {}", e.error),
                Some(final_path.clone()),
            )
        })?;
        sync_parent_dir(&final_path).await;

        self.existence_cache.insert(id.clone());
        info!(hash = %id, size = size, path = %final_path.display(), "Stored staged blob");
        Ok(PutOutcome::Created)
    }

    async fn publish(
        &self,
        id: &ContentId,
        temp_path: &Path,
        final_path: &Path,
        size: u64,
        cleanup: scopeguard::ScopeGuard<PathBuf, impl FnOnce(PathBuf)>,
    ) -> Result<PutOutcome> {
        // A concurrent writer finished first: its bytes hash to the same id
        if path_exists(final_path).await? {
            self.existence_cache.insert(id.clone());
            debug!(hash = %id, "Blob appeared during write, keeping existing copy");
            return Ok(PutOutcome::AlreadyExists);
        }

        fs::rename(temp_path, final_path).await.map_err(|e| {
            AppError::storage_error(
                format!("Failed to rename blob into place: {}", e),
                Some(final_path.to_path_buf()),
            )
        })?;
        scopeguard::ScopeGuard::into_inner(cleanup);
        sync_parent_dir(final_path).await;

        self.existence_cache.insert(id.clone());
        info!(
            hash = %id,
            size = size,
            path = %final_path.display(),
            "Stored blob"
        );
        Ok(PutOutcome::Created)
    }

    async fn ensure_shard_dir(&self, id: &ContentId) -> Result<PathBuf> {
        let dir = self.root.join(shard::shard_dir(id));
        fs::create_dir_all(&dir).await.map_err(|e| {
            AppError::storage_error(
                format!("Failed to create shard directory: {}", e),
                Some(dir.clone()),
            )
        })?;
        Ok(dir)
    }

    async fn is_cached_present(&self, id: &ContentId) -> bool {
        if self.existence_cache.contains(id) {
            debug!(hash = %id, "Content already exists (cached), skipping write");
            return true;
        }
        false
    }

    /// Check the disk, bypassing and correcting the existence cache
    pub async fn probe(&self, id: &ContentId) -> Result<bool> {
        let present = path_exists(&self.blob_path(id)).await?;
        if present {
            self.existence_cache.insert(id.clone());
        } else {
            self.existence_cache.remove(id);
        }
        Ok(present)
    }

    /// Re-hash a stored blob and compare with its id
    ///
    /// Returns `Ok(false)` for a missing or mismatching blob.
    pub async fn verify(&self, id: &ContentId) -> Result<bool> {
        let path = self.blob_path(id);
        if !path_exists(&path).await? {
            return Ok(false);
        }
        let (actual, _) = hash_file(&path).await?;
        Ok(actual == *id)
    }

    /// Time since the blob was last written; `None` when it is absent
    ///
    /// A modification time in the future counts as zero age.
    pub async fn blob_age(&self, id: &ContentId) -> Result<Option<Duration>> {
        let path = self.blob_path(id);
        let metadata = match fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(AppError::storage_error(
                    format!("Failed to stat blob: {}", e),
                    Some(path),
                ))
            }
        };
        let modified = metadata.modified().map_err(|e| {
            AppError::storage_error(format!("No modification time: {}", e), Some(path.clone()))
        })?;
        Ok(Some(
            SystemTime::now()
                .duration_since(modified)
                .unwrap_or(Duration::ZERO),
        ))
    }

    /// Move a corrupt blob out of its final path
    ///
    /// The file is renamed to `.<id>.corrupt-<uuid>` in the same directory,
    /// which neither the blob scan nor temp cleanup touches. Returns the
    /// new path, or `None` when there was no blob.
    pub async fn quarantine(&self, id: &ContentId) -> Result<Option<PathBuf>> {
        let path = self.blob_path(id);
        self.existence_cache.remove(id);
        if !path_exists(&path).await? {
            return Ok(None);
        }

        let target = path.with_file_name(format!(".{}.corrupt-{}", id, Uuid::new_v4().simple()));
        fs::rename(&path, &target).await.map_err(|e| {
            AppError::storage_error(format!("Failed to quarantine blob: {}", e), Some(path.clone()))
        })?;
        warn!(hash = %id, path = %target.display(), "Quarantined corrupt blob");
        Ok(Some(target))
    }

    /// Total bytes held in blobs (sidecars and temp files excluded)
    pub async fn storage_size(&self) -> Result<u64> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            walk_blobs(&root)
                .filter_map(|(_, entry)| entry.metadata().ok())
                .map(|m| m.len())
                .sum()
        })
        .await
        .map_err(|e| AppError::storage_error(format!("Storage walk panicked: {}", e), None))
    }

    /// Every blob id present on disk
    pub async fn list_blob_ids(&self) -> Result<Vec<ContentId>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || walk_blobs(&root).map(|(id, _)| id).collect())
            .await
            .map_err(|e| AppError::storage_error(format!("Storage walk panicked: {}", e), None))
    }

    /// Temp and staging files not modified for at least `older_than`
    pub async fn stale_temp_files(&self, older_than: Duration) -> Result<Vec<PathBuf>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let now = SystemTime::now();
            WalkDir::new(&root)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter(|e| shard::is_temp_file_name(&e.file_name().to_string_lossy()))
                .filter(|e| {
                    e.metadata()
                        .ok()
                        .and_then(|m| m.modified().ok())
                        .and_then(|modified| now.duration_since(modified).ok())
                        .map(|age| age >= older_than)
                        .unwrap_or(false)
                })
                .map(|e| e.into_path())
                .collect()
        })
        .await
        .map_err(|e| AppError::storage_error(format!("Storage walk panicked: {}", e), None))
    }

    /// Delete stale temp files; returns how many were removed
    pub async fn remove_stale_temp_files(&self, older_than: Duration) -> Result<usize> {
        let mut removed = 0;
        for path in self.stale_temp_files(older_than).await? {
            match fs::remove_file(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), "Removed stale temp file");
                    removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove stale temp file"),
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl BlobBackend for LocalBlobStore {
    fn kind(&self) -> Backend {
        Backend::Local
    }

    fn locate(&self, id: &ContentId) -> String {
        self.blob_path(id).to_string_lossy().into_owned()
    }

    async fn put(&self, id: &ContentId, bytes: Bytes) -> Result<PutOutcome> {
        self.put_reader(id, &bytes[..]).await
    }

    async fn get(&self, id: &ContentId) -> Result<Bytes> {
        let path = self.blob_path(id);
        match fs::read(&path).await {
            Ok(content) => Ok(Bytes::from(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.existence_cache.remove(id);
                Err(AppError::not_found(format!(
                    "Blob not found: {} at path: {}",
                    id,
                    path.display()
                )))
            }
            Err(e) => Err(AppError::storage_error(
                format!("Failed to read blob {}: {}", id, e),
                Some(path),
            )),
        }
    }

    async fn exists(&self, id: &ContentId) -> Result<bool> {
        if self.existence_cache.contains(id) {
            return Ok(true);
        }
        self.probe(id).await
    }
}

/// Write `bytes` to `path` through a sibling temp file and a rename
pub(crate) async fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = parent.join(format!(
        ".{}.{}{}",
        file_name,
        Uuid::new_v4().simple(),
        TEMP_SUFFIX
    ));
    let cleanup = scopeguard::guard(temp_path.clone(), |p| {
        let _ = std::fs::remove_file(p);
    });

    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&temp_path, path).await?;
    scopeguard::ScopeGuard::into_inner(cleanup);
    Ok(())
}

async fn path_exists(path: &Path) -> Result<bool> {
    fs::try_exists(path).await.map_err(|e| {
        AppError::storage_error(
            format!("Failed to check blob existence: {}", e),
            Some(path.to_path_buf()),
        )
    })
}

/// Make the rename durable; best-effort and unix-only
async fn sync_parent_dir(path: &Path) {
    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent).await {
            if let Err(e) = dir.sync_all().await {
                debug!(dir = %parent.display(), error = %e, "Directory sync failed");
            }
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

fn with_storage_path(error: AppError, path: &Path) -> AppError {
    match error {
        AppError::Storage { message, path: None } => AppError::Storage {
            message,
            path: Some(path.to_path_buf()),
        },
        other => other,
    }
}

fn walk_blobs(root: &Path) -> impl Iterator<Item = (ContentId, walkdir::DirEntry)> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || e.file_name() != STAGING_DIR)
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let id = shard::parse_blob_file_name(&e.file_name().to_string_lossy())?;
            Some((id, e))
        })
}
