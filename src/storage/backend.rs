//! Blob backend capability
//!
//! Every place a blob can live (local disk, a cloud bucket) implements the
//! same small contract. New backends implement this trait rather than adding
//! branches on a backend name.

use crate::error::Result;
use crate::models::Backend;
use crate::storage::hasher::ContentId;
use async_trait::async_trait;
use bytes::Bytes;

/// Result of a `put`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The blob was written by this call
    Created,
    /// A blob for this id was already present; nothing was written
    AlreadyExists,
}

impl PutOutcome {
    pub fn is_created(&self) -> bool {
        matches!(self, PutOutcome::Created)
    }
}

#[async_trait]
pub trait BlobBackend: Send + Sync {
    /// Which ledger backend this store records locations as
    fn kind(&self) -> Backend;

    /// Path or URL recorded in the ledger for `id`
    fn locate(&self, id: &ContentId) -> String;

    /// Store `bytes` under `id`
    ///
    /// Idempotent: an existing blob yields `AlreadyExists`. Implementations
    /// must reject bytes that do not hash to `id`.
    async fn put(&self, id: &ContentId, bytes: Bytes) -> Result<PutOutcome>;

    /// Fetch a blob; a missing blob is `AppError::NotFound`
    async fn get(&self, id: &ContentId) -> Result<Bytes>;

    /// Presence check; transport failures are errors, never `false`
    async fn exists(&self, id: &ContentId) -> Result<bool>;
}
