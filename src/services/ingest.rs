//! Ingestion pipeline
//!
//! One file (or stream) moves through these stages:
//!
//! ```text
//! Hashing -> DedupeCheck -> Persist -> TagExtract -> LedgerCommit -> Sidecar -> CloudEnqueue
//! ```
//!
//! Everything before `LedgerCommit` leaves no durable state except, at
//! worst, a blob without a ledger row (an orphan the reconciler re-links).
//! Everything after it is best-effort: the content is already safe.

use crate::error::{AppError, Result};
use crate::infrastructure::config::IngestConfig;
use crate::models::{Backend, FileDelta, FileRecord, Location, MetadataBag, OriginalPath, SyncState};
use crate::services::tagging::TagExtractor;
use crate::storage::backend::BlobBackend;
use crate::storage::cas::LocalBlobStore;
use crate::storage::hasher::{hash_file, ContentId};
use crate::storage::ledger::Ledger;
use crate::storage::sidecar::write_sidecar;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Provenance for one ingestion
#[derive(Debug, Clone, Default)]
pub struct IngestRequest {
    /// Where the bytes were found, as the user knows it
    pub original_path: String,
    /// Label for the machine or archive, e.g. `OldMacDrive`
    pub source: String,
    pub extra_tags: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    pub metadata: MetadataBag,
}

impl IngestRequest {
    pub fn new(original_path: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            original_path: original_path.into(),
            source: source.into(),
            ..Default::default()
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_metadata(mut self, metadata: MetadataBag) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    /// First time this content was seen, or the first real sighting of a
    /// blob the reconciler recovered without provenance
    New,
    /// Known content found at a new path
    AlternateLocation,
    /// Known content at a known path
    Duplicate,
}

impl IngestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStatus::New => "new",
            IngestStatus::AlternateLocation => "alternate_location",
            IngestStatus::Duplicate => "duplicate",
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub content_id: ContentId,
    pub status: IngestStatus,
    pub record: FileRecord,
    /// True when this call wrote the local blob
    pub blob_written: bool,
    /// True when this call queued the cloud upload
    pub cloud_enqueued: bool,
}

/// One failed file in a batch
#[derive(Debug, Clone, Serialize)]
pub struct ImportFailure {
    pub path: PathBuf,
    pub kind: &'static str,
    pub message: String,
}

/// Batch totals, by outcome
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportSummary {
    pub total: usize,
    pub new: usize,
    pub alternate_location: usize,
    pub duplicate: usize,
    /// Blob stored but the ledger commit failed; repaired by `reconcile`
    pub deferred: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub bytes_stored: u64,
    pub failures: Vec<ImportFailure>,
}

impl ImportSummary {
    fn record(&mut self, path: &Path, result: &Result<IngestOutcome>) {
        self.total += 1;
        match result {
            Ok(outcome) => {
                match outcome.status {
                    IngestStatus::New => self.new += 1,
                    IngestStatus::AlternateLocation => self.alternate_location += 1,
                    IngestStatus::Duplicate => self.duplicate += 1,
                }
                if outcome.blob_written {
                    self.bytes_stored += outcome.record.size;
                }
            }
            Err(AppError::Cancelled(_)) => self.cancelled += 1,
            Err(e) => {
                if e.is_deferred_repair() {
                    self.deferred += 1;
                } else {
                    self.failed += 1;
                }
                self.failures.push(ImportFailure {
                    path: path.to_path_buf(),
                    kind: e.error_kind(),
                    message: e.to_string(),
                });
            }
        }
    }

    /// Files whose content is now in the vault
    pub fn succeeded(&self) -> usize {
        self.new + self.alternate_location + self.duplicate
    }
}

/// Hashed content waiting for the rest of the pipeline
enum Hashed {
    File { path: PathBuf },
    Staged(crate::storage::cas::StagedBlob),
}

/// The ingestion engine
///
/// Stateless apart from its injected collaborators; safe to share across
/// tasks behind an `Arc`.
pub struct IngestionPipeline {
    store: Arc<LocalBlobStore>,
    ledger: Arc<Ledger>,
    cloud: Option<Arc<dyn BlobBackend>>,
    config: IngestConfig,
    tagger: TagExtractor,
    cancel: CancellationToken,
}

impl IngestionPipeline {
    pub fn new(store: Arc<LocalBlobStore>, ledger: Arc<Ledger>, config: IngestConfig) -> Self {
        let tagger = TagExtractor::new(&config.tag_stopwords);
        Self {
            store,
            ledger,
            cloud: None,
            config,
            tagger,
            cancel: CancellationToken::new(),
        }
    }

    /// Cloud backend used to name the location queued by `CloudEnqueue`
    pub fn with_cloud(mut self, cloud: Arc<dyn BlobBackend>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Ingest a file on disk
    ///
    /// Creation and modification times are taken from the file when the
    /// request does not carry them.
    pub async fn ingest_path(&self, path: &Path, mut request: IngestRequest) -> Result<IngestOutcome> {
        let (content_id, size) = hash_file(path).await?;
        debug!(hash = %content_id, size = size, path = %path.display(), "Hashed");

        if let Ok(meta) = tokio::fs::metadata(path).await {
            if request.created_at.is_none() {
                request.created_at = meta.created().ok().map(DateTime::<Utc>::from);
            }
            if request.modified_at.is_none() {
                request.modified_at = meta.modified().ok().map(DateTime::<Utc>::from);
            }
        }
        if request.original_path.is_empty() {
            request.original_path = path.to_string_lossy().into_owned();
        }

        self.finish(
            content_id,
            size,
            Hashed::File {
                path: path.to_path_buf(),
            },
            request,
        )
        .await
    }

    /// Ingest a byte stream
    ///
    /// The stream is spooled to the store's staging area while it is
    /// hashed, so it is never held in memory. A stream error aborts with
    /// `AppError::Read` and leaves nothing behind.
    pub async fn ingest_stream<R>(&self, reader: R, request: IngestRequest) -> Result<IngestOutcome>
    where
        R: AsyncRead + Unpin + Send,
    {
        if request.original_path.is_empty() {
            return Err(AppError::validation_error("stream ingestion needs an original path"));
        }

        let staged = self.store.stage_reader(reader).await?;
        let content_id = staged.content_id.clone();
        let size = staged.size;
        debug!(hash = %content_id, size = size, path = %request.original_path, "Hashed stream");

        self.finish(content_id, size, Hashed::Staged(staged), request)
            .await
    }

    async fn finish(
        &self,
        content_id: ContentId,
        size: u64,
        hashed: Hashed,
        request: IngestRequest,
    ) -> Result<IngestOutcome> {
        // DedupeCheck
        let existing = self
            .ledger
            .lookup(&content_id)
            .await
            .map_err(|e| e.with_content_id(content_id.as_str()))?;
        let local_synced = existing
            .as_ref()
            .and_then(|record| record.location(Backend::Local))
            .map(|location| location.sync_state.is_synced())
            .unwrap_or(false);

        // Persist: known content with a healthy local copy skips the write
        let blob_written = if local_synced {
            debug!(hash = %content_id, "Content already stored, skipping write");
            false
        } else {
            self.check_cancelled(&content_id, "persist")?;
            if existing.is_some() {
                // Known id whose local copy was demoted: refresh the store's cache
                self.store.probe(&content_id).await?;
            }
            let outcome = match hashed {
                Hashed::File { path } => self.store.put_file(&content_id, &path).await?,
                Hashed::Staged(staged) => self.store.put_staged(staged).await?,
            };
            outcome.is_created()
        };

        // TagExtract
        let mut tags = self.tagger.extract(&request.original_path);
        tags.extend(self.tagger.normalize_all(&request.extra_tags));

        self.check_cancelled(&content_id, "ledger commit")?;

        // LedgerCommit
        let mut locations = Vec::new();
        if !local_synced {
            locations.push(Location::new(
                Backend::Local,
                self.store.locate(&content_id),
                SyncState::Synced,
            ));
        }
        if self.config.track_legacy_locations {
            locations.push(Location::new(
                Backend::Legacy,
                request.original_path.clone(),
                SyncState::Synced,
            ));
        }

        let (original_filename, file_extension) = split_file_name(&request.original_path);
        let delta = FileDelta {
            size,
            mime_type: mime_guess::from_path(&original_filename)
                .first()
                .map(|mime| mime.essence_str().to_string()),
            original_filename,
            file_extension,
            created_at: request.created_at,
            modified_at: request.modified_at,
            original_source: request.source.clone(),
            original_paths: vec![OriginalPath::new(
                request.original_path.clone(),
                request.source.clone(),
            )],
            tags,
            metadata: request.metadata,
            locations,
        };

        let upsert = self.ledger.upsert(&content_id, delta).await.map_err(|e| {
            let e = e.with_content_id(content_id.as_str()).into_deferred();
            if e.is_deferred_repair() {
                error!(
                    hash = %content_id,
                    path = %request.original_path,
                    error = %e,
                    "Ledger commit failed after blob write; left for reconciliation"
                );
            }
            e
        })?;

        let status = if upsert.created || upsert.adopted {
            IngestStatus::New
        } else if upsert.added_paths > 0 {
            IngestStatus::AlternateLocation
        } else {
            IngestStatus::Duplicate
        };
        let mut record = upsert.record;

        // Sidecar
        if self.config.sidecar_enabled {
            if let Err(e) = write_sidecar(self.store.root(), &record).await {
                warn!(hash = %content_id, error = %e, "Sidecar write failed");
            }
        }

        // CloudEnqueue
        let cloud_enqueued = self.enqueue_cloud(&mut record).await;

        info!(
            hash = %content_id,
            status = status.as_str(),
            path = %request.original_path,
            source = %request.source,
            size = size,
            "Ingested"
        );

        Ok(IngestOutcome {
            content_id,
            status,
            record,
            blob_written,
            cloud_enqueued,
        })
    }

    async fn enqueue_cloud(&self, record: &mut FileRecord) -> bool {
        if !self.config.cloud_sync_enabled || record.location(Backend::Cloud).is_some() {
            return false;
        }
        let Some(cloud) = &self.cloud else {
            warn!(hash = %record.content_id, "Cloud sync enabled without a cloud backend");
            return false;
        };

        let url = cloud.locate(&record.content_id);
        match self
            .ledger
            .enqueue_location(&record.content_id, Backend::Cloud, &url)
            .await
        {
            Ok(true) => {
                record
                    .locations
                    .push(Location::new(Backend::Cloud, url, SyncState::Pending));
                record.locations.sort_by_key(|l| l.backend);
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(hash = %record.content_id, error = %e, "Cloud enqueue failed; reconcile will pick it up");
                false
            }
        }
    }

    fn check_cancelled(&self, id: &ContentId, stage: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            debug!(hash = %id, stage = stage, "Ingestion cancelled");
            return Err(AppError::Cancelled(format!("{} cancelled before {}", id.short(), stage)));
        }
        Ok(())
    }

    /// Ingest many files with bounded concurrency
    ///
    /// Every file is attempted; failures are counted, not propagated.
    pub async fn ingest_many(
        &self,
        paths: Vec<PathBuf>,
        source: &str,
        extra_tags: &[String],
    ) -> ImportSummary {
        let total = paths.len();
        let workers = self.config.max_concurrent_files.max(1);
        info!(files = total, workers = workers, source = source, "Starting import");

        let mut results = stream::iter(paths)
            .map(|path| async move {
                let result = if self.cancel.is_cancelled() {
                    Err(AppError::Cancelled(format!("{} not started", path.display())))
                } else {
                    let request = IngestRequest::new(path.to_string_lossy(), source)
                        .with_tags(extra_tags.iter().cloned());
                    self.ingest_path(&path, request).await
                };
                (path, result)
            })
            .buffer_unordered(workers);

        let mut summary = ImportSummary::default();
        while let Some((path, result)) = results.next().await {
            if let Err(e) = &result {
                if !matches!(e, AppError::Cancelled(_)) {
                    warn!(path = %path.display(), kind = e.error_kind(), error = %e, "Import failed");
                }
            }
            summary.record(&path, &result);
            if summary.total % 100 == 0 {
                info!(done = summary.total, of = total, "Import progress");
            }
        }

        info!(
            new = summary.new,
            alternate_location = summary.alternate_location,
            duplicate = summary.duplicate,
            deferred = summary.deferred,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "Import finished"
        );
        summary
    }
}

/// Regular files under `root` (or `root` itself when it is a file)
///
/// Hidden files and directories are skipped, as are symlinks.
pub fn collect_files(root: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
    let meta = std::fs::metadata(root).map_err(|e| {
        AppError::read_error(format!("Cannot read input: {}", e), Some(root.to_path_buf()))
    })?;
    if meta.is_file() {
        return Ok(vec![root.to_path_buf()]);
    }

    let max_depth = if recursive { usize::MAX } else { 1 };
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .max_depth(max_depth)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));

    for entry in walker {
        match entry {
            Ok(entry) if entry.file_type().is_file() => files.push(entry.into_path()),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Skipping unreadable entry"),
        }
    }
    Ok(files)
}

/// File name and lower-case extension (without the dot) of a path
fn split_file_name(original_path: &str) -> (String, String) {
    let name = original_path
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(original_path)
        .to_string();
    let extension = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_lowercase(),
        _ => String::new(),
    };
    (name, extension)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::hasher::hash_bytes;
    use crate::storage::shard;
    use rstest::rstest;
    use tempfile::TempDir;

    async fn pipeline(temp_dir: &TempDir, config: IngestConfig) -> IngestionPipeline {
        let store = Arc::new(LocalBlobStore::new(temp_dir.path().join("storage")));
        let ledger = Arc::new(Ledger::open_in_memory().await.unwrap());
        IngestionPipeline::new(store, ledger, config)
    }

    #[rstest]
    #[case("Projects/Site/logo.png", "logo.png", "png")]
    #[case(r"C:\Backup\REPORT.PDF", "REPORT.PDF", "pdf")]
    #[case("archive.tar.gz", "archive.tar.gz", "gz")]
    #[case("home/.bashrc", ".bashrc", "")]
    #[case("Makefile", "Makefile", "")]
    fn test_split_file_name(#[case] path: &str, #[case] name: &str, #[case] ext: &str) {
        assert_eq!(split_file_name(path), (name.to_string(), ext.to_string()));
    }

    #[tokio::test]
    async fn test_stream_ingest_new_then_duplicate() {
        let temp_dir = TempDir::new().unwrap();
        let pipeline = pipeline(&temp_dir, IngestConfig::default()).await;
        let content = b"hello vault".to_vec();

        let first = pipeline
            .ingest_stream(&content[..], IngestRequest::new("Docs/hello.txt", "laptop"))
            .await
            .unwrap();
        assert_eq!(first.status, IngestStatus::New);
        assert!(first.blob_written);
        assert_eq!(first.content_id, hash_bytes(&content));
        assert_eq!(first.record.mime_type.as_deref(), Some("text/plain"));
        assert_eq!(first.record.file_extension, "txt");
        assert!(first.record.tags.contains("docs"));

        let again = pipeline
            .ingest_stream(&content[..], IngestRequest::new("Docs/hello.txt", "laptop"))
            .await
            .unwrap();
        assert_eq!(again.status, IngestStatus::Duplicate);
        assert!(!again.blob_written);
        assert_eq!(again.record.original_paths, first.record.original_paths);
        assert_eq!(again.record.tags, first.record.tags);

        // Sidecar written next to the blob
        let sidecar = temp_dir
            .path()
            .join("storage")
            .join(shard::sidecar_path(&first.content_id));
        assert!(sidecar.exists());
    }

    #[tokio::test]
    async fn test_stream_read_error_leaves_nothing() {
        // Some bytes arrive, then the device goes away
        let unplugged = tokio_test::io::Builder::new()
            .read(b"first chunk of a large file")
            .read_error(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "device unplugged",
            ))
            .build();

        let temp_dir = TempDir::new().unwrap();
        let pipeline = pipeline(&temp_dir, IngestConfig::default()).await;
        let err = pipeline
            .ingest_stream(unplugged, IngestRequest::new("usb/file.bin", "usb"))
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Read { .. }));
        assert!(pipeline.ledger.all_ids().await.unwrap().is_empty());
        assert!(pipeline.store.list_blob_ids().await.unwrap().is_empty());
        let staging = std::fs::read_dir(pipeline.store.staging_dir()).unwrap().count();
        assert_eq!(staging, 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_persist_writes_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let pipeline = pipeline(&temp_dir, IngestConfig::default())
            .await
            .with_cancellation(cancel.clone());
        cancel.cancel();

        let err = pipeline
            .ingest_stream(&b"late"[..], IngestRequest::new("a/late.txt", "mac"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Cancelled(_)));
        assert!(pipeline.store.list_blob_ids().await.unwrap().is_empty());
        assert!(pipeline.ledger.all_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cloud_enqueue_marks_pending_once() {
        use crate::storage::cloud::{CloudBlobStore, InMemoryObjectStore};

        let temp_dir = TempDir::new().unwrap();
        let config = IngestConfig {
            cloud_sync_enabled: true,
            ..Default::default()
        };
        let cloud = Arc::new(CloudBlobStore::new(
            Arc::new(InMemoryObjectStore::new("vault")),
            "blobs",
        ));
        let pipeline = pipeline(&temp_dir, config).await.with_cloud(cloud);

        let first = pipeline
            .ingest_stream(&b"upload me"[..], IngestRequest::new("a/u.bin", "mac"))
            .await
            .unwrap();
        assert!(first.cloud_enqueued);
        assert_eq!(
            first.record.location(Backend::Cloud).unwrap().sync_state,
            SyncState::Pending
        );

        let second = pipeline
            .ingest_stream(&b"upload me"[..], IngestRequest::new("b/u.bin", "mac"))
            .await
            .unwrap();
        assert!(!second.cloud_enqueued);
        assert_eq!(second.status, IngestStatus::AlternateLocation);
    }

    #[tokio::test]
    async fn test_legacy_location_is_first_seen() {
        let temp_dir = TempDir::new().unwrap();
        let config = IngestConfig {
            track_legacy_locations: true,
            sidecar_enabled: false,
            ..Default::default()
        };
        let pipeline = pipeline(&temp_dir, config).await;

        pipeline
            .ingest_stream(&b"old"[..], IngestRequest::new("/Volumes/Old/a.txt", "old-mac"))
            .await
            .unwrap();
        let outcome = pipeline
            .ingest_stream(&b"old"[..], IngestRequest::new("/media/usb/a.txt", "usb"))
            .await
            .unwrap();

        let legacy = outcome.record.location(Backend::Legacy).unwrap();
        assert_eq!(legacy.path_or_url, "/Volumes/Old/a.txt");
        let sidecar = temp_dir
            .path()
            .join("storage")
            .join(shard::sidecar_path(&outcome.content_id));
        assert!(!sidecar.exists());
    }

    #[tokio::test]
    async fn test_missing_blob_is_rewritten_when_local_not_synced() {
        let temp_dir = TempDir::new().unwrap();
        let pipeline = pipeline(&temp_dir, IngestConfig::default()).await;
        let first = pipeline
            .ingest_stream(&b"fragile"[..], IngestRequest::new("a/f.txt", "mac"))
            .await
            .unwrap();

        // Simulate the reconciler having demoted a lost blob
        std::fs::remove_file(pipeline.store.blob_path(&first.content_id)).unwrap();
        pipeline
            .ledger
            .record_location_failure(&first.content_id, Backend::Local, "blob missing")
            .await
            .unwrap();

        let healed = pipeline
            .ingest_stream(&b"fragile"[..], IngestRequest::new("b/f.txt", "usb"))
            .await
            .unwrap();
        assert!(healed.blob_written);
        assert!(healed
            .record
            .location(Backend::Local)
            .unwrap()
            .sync_state
            .is_synced());
        assert!(pipeline.store.verify(&first.content_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_unreadable_ledger_fails_before_any_blob_is_written() {
        let temp_dir = TempDir::new().unwrap();
        let pipeline = pipeline(&temp_dir, IngestConfig::default()).await;
        let source = temp_dir.path().join("inbox/note.txt");
        std::fs::create_dir_all(source.parent().unwrap()).unwrap();
        std::fs::write(&source, b"never stored").unwrap();

        pipeline.ledger.close().await;

        let err = pipeline
            .ingest_path(&source, IngestRequest::new("inbox/note.txt", "mac"))
            .await
            .unwrap_err();
        assert_eq!(err.error_kind(), "ledger");
        assert!(!err.is_deferred_repair());

        let summary = pipeline.ingest_many(vec![source], "mac", &[]).await;
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.deferred, 0);
        assert!(pipeline.store.list_blob_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_collect_files_skips_hidden() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        std::fs::create_dir_all(root.join("sub/deeper")).unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::write(root.join("a.txt"), b"a").unwrap();
        std::fs::write(root.join(".hidden"), b"h").unwrap();
        std::fs::write(root.join(".git/config"), b"g").unwrap();
        std::fs::write(root.join("sub/b.txt"), b"b").unwrap();
        std::fs::write(root.join("sub/deeper/c.txt"), b"c").unwrap();

        assert_eq!(collect_files(root, false).unwrap().len(), 1);
        assert_eq!(collect_files(root, true).unwrap().len(), 3);
        assert_eq!(collect_files(&root.join("a.txt"), true).unwrap().len(), 1);
        assert!(collect_files(&root.join("absent"), true).is_err());
    }
}
