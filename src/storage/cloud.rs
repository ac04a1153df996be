//! Cloud object store backend
//!
//! [`CloudBlobStore`] adapts any [`ObjectStoreClient`] to the
//! [`BlobBackend`] contract. Keys keep the local shard scheme under a
//! configurable prefix, so a bucket listing mirrors the storage tree.
//!
//! Transport failures are always `AppError::Cloud { retryable: true }`; an
//! unreachable bucket is never reported as a missing object.

use crate::error::{AppError, Result};
use crate::models::Backend;
use crate::storage::backend::{BlobBackend, PutOutcome};
use crate::storage::cas::atomic_write;
use crate::storage::hasher::{hash_bytes, ContentId};
use crate::storage::shard;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

/// Minimal object store capability
#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    /// Base URL used when recording locations, e.g. `mem://vault`
    fn endpoint(&self) -> String;

    async fn put_object(&self, key: &str, body: Bytes) -> Result<()>;

    /// `Ok(None)` when the object does not exist
    async fn get_object(&self, key: &str) -> Result<Option<Bytes>>;

    async fn object_exists(&self, key: &str) -> Result<bool>;
}

#[derive(Debug, Default)]
struct FaultState {
    fail_next: u32,
    offline: bool,
}

/// In-process object store with fault injection
///
/// Objects live only as long as the value, so it is not offered as a
/// configurable cloud kind.
#[derive(Debug)]
pub struct InMemoryObjectStore {
    bucket: String,
    objects: DashMap<String, Bytes>,
    faults: Mutex<FaultState>,
    put_calls: AtomicU64,
}

impl InMemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: DashMap::new(),
            faults: Mutex::new(FaultState::default()),
            put_calls: AtomicU64::new(0),
        }
    }

    /// Fail the next `n` operations with a retryable error
    pub fn fail_next(&self, n: u32) {
        self.faults.lock().fail_next = n;
    }

    /// Fail every operation until switched back
    pub fn set_offline(&self, offline: bool) {
        self.faults.lock().offline = offline;
    }

    /// Number of `put_object` calls that reached the store
    pub fn put_calls(&self) -> u64 {
        self.put_calls.load(Ordering::Relaxed)
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Overwrite an object directly, bypassing all checks
    pub fn insert_raw(&self, key: impl Into<String>, body: Bytes) {
        self.objects.insert(key.into(), body);
    }

    fn check_faults(&self, op: &str, key: &str) -> Result<()> {
        let mut faults = self.faults.lock();
        if faults.offline {
            return Err(AppError::cloud_error(
                format!("{} {}: bucket '{}' is offline", op, key, self.bucket),
                true,
            ));
        }
        if faults.fail_next > 0 {
            faults.fail_next -= 1;
            return Err(AppError::cloud_error(
                format!("{} {}: injected transport failure", op, key),
                true,
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStoreClient for InMemoryObjectStore {
    fn endpoint(&self) -> String {
        format!("mem://{}", self.bucket)
    }

    async fn put_object(&self, key: &str, body: Bytes) -> Result<()> {
        self.check_faults("PUT", key)?;
        self.put_calls.fetch_add(1, Ordering::Relaxed);
        self.objects.insert(key.to_string(), body);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<Bytes>> {
        self.check_faults("GET", key)?;
        Ok(self.objects.get(key).map(|entry| entry.value().clone()))
    }

    async fn object_exists(&self, key: &str) -> Result<bool> {
        self.check_faults("HEAD", key)?;
        Ok(self.objects.contains_key(key))
    }
}

/// A directory standing in for a bucket (rclone or NFS mount)
#[derive(Debug, Clone)]
pub struct MountedBucket {
    root: PathBuf,
}

impl MountedBucket {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, key: &str) -> PathBuf {
        key.split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |path, part| path.join(part))
    }

    /// An absent mount root means the mount is down, not that objects are missing
    async fn ensure_mounted(&self) -> Result<()> {
        match fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(AppError::cloud_error(
                format!("mount point {} is not a directory", self.root.display()),
                false,
            )),
            Err(e) => Err(mount_error(&self.root, e)),
        }
    }
}

fn mount_error(path: &Path, e: std::io::Error) -> AppError {
    AppError::cloud_error(format!("bucket mount {}: {}", path.display(), e), true)
}

#[async_trait]
impl ObjectStoreClient for MountedBucket {
    fn endpoint(&self) -> String {
        format!("file://{}", self.root.display())
    }

    async fn put_object(&self, key: &str, body: Bytes) -> Result<()> {
        self.ensure_mounted().await?;
        let path = self.object_path(key);
        atomic_write(&path, &body)
            .await
            .map_err(|e| mount_error(&path, e))
    }

    async fn get_object(&self, key: &str) -> Result<Option<Bytes>> {
        self.ensure_mounted().await?;
        let path = self.object_path(key);
        match fs::read(&path).await {
            Ok(body) => Ok(Some(Bytes::from(body))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(mount_error(&path, e)),
        }
    }

    async fn object_exists(&self, key: &str) -> Result<bool> {
        self.ensure_mounted().await?;
        let path = self.object_path(key);
        fs::try_exists(&path)
            .await
            .map_err(|e| mount_error(&path, e))
    }
}

/// `BlobBackend` over an object store
#[derive(Clone)]
pub struct CloudBlobStore {
    client: Arc<dyn ObjectStoreClient>,
    prefix: String,
}

impl CloudBlobStore {
    pub fn new(client: Arc<dyn ObjectStoreClient>, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    pub fn object_key(&self, id: &ContentId) -> String {
        shard::object_key(&self.prefix, id)
    }
}

impl std::fmt::Debug for CloudBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudBlobStore")
            .field("endpoint", &self.client.endpoint())
            .field("prefix", &self.prefix)
            .finish()
    }
}

#[async_trait]
impl BlobBackend for CloudBlobStore {
    fn kind(&self) -> Backend {
        Backend::Cloud
    }

    fn locate(&self, id: &ContentId) -> String {
        format!(
            "{}/{}",
            self.client.endpoint().trim_end_matches('/'),
            self.object_key(id)
        )
    }

    async fn put(&self, id: &ContentId, bytes: Bytes) -> Result<PutOutcome> {
        let actual = hash_bytes(&bytes);
        if actual != *id {
            return Err(AppError::corruption(id.as_str(), actual.as_str()));
        }

        let key = self.object_key(id);
        if self.client.object_exists(&key).await? {
            debug!(hash = %id, key = %key, "Object already in bucket");
            return Ok(PutOutcome::AlreadyExists);
        }

        let size = bytes.len();
        self.client.put_object(&key, bytes).await?;
        info!(hash = %id, key = %key, size = size, "Uploaded blob");
        Ok(PutOutcome::Created)
    }

    async fn get(&self, id: &ContentId) -> Result<Bytes> {
        let key = self.object_key(id);
        let bytes = self
            .client
            .get_object(&key)
            .await?
            .ok_or_else(|| AppError::not_found(format!("object {} not in bucket", key)))?;

        let actual = hash_bytes(&bytes);
        if actual != *id {
            warn!(hash = %id, actual = %actual, key = %key, "Cloud object fails verification");
            return Err(AppError::corruption(id.as_str(), actual.as_str()));
        }
        Ok(bytes)
    }

    async fn exists(&self, id: &ContentId) -> Result<bool> {
        self.client.object_exists(&self.object_key(id)).await
    }
}
