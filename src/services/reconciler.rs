//! Sync reconciler
//!
//! Closes the gaps the ingestion pipeline is allowed to leave behind and
//! drives cloud replication. One pass runs four phases:
//!
//! 1. dangling scan: ledger says Local, disk disagrees
//! 2. orphan scan: blob on disk, no ledger row, older than the grace window
//! 3. upload retry: pending or failed cloud locations, within the retry budget
//! 4. temp cleanup: leftovers of interrupted writes
//!
//! Per-item problems are collected into the report; only a failing ledger
//! query aborts a pass.

use crate::error::{AppError, Result};
use crate::infrastructure::config::ReconcileConfig;
use crate::models::{
    Backend, FileDelta, FileRecord, Location, OriginalPath, SyncState, UNKNOWN_ORIGIN,
};
use crate::storage::backend::BlobBackend;
use crate::storage::cas::LocalBlobStore;
use crate::storage::hasher::{hash_bytes, ContentId};
use crate::storage::ledger::Ledger;
use crate::storage::shard;
use crate::storage::sidecar::read_sidecar;
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default upload attempts before giving up on a location
pub const DEFAULT_RETRY_BUDGET: u32 = 5;

/// A location that exhausted its retry budget
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermanentSyncFailure {
    pub content_id: ContentId,
    pub backend: Backend,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl PermanentSyncFailure {
    pub fn to_error(&self) -> AppError {
        AppError::PermanentSyncFailure {
            content_id: self.content_id.to_string(),
            attempts: self.attempts,
            last_error: self
                .last_error
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconciliationReport {
    pub resolved_orphans: usize,
    pub demoted_dangling: usize,
    pub retried_uploads: usize,
    pub permanent_failures: Vec<PermanentSyncFailure>,
    pub restored_local: usize,
    pub removed_temp_files: usize,
    pub warnings: Vec<String>,
}

impl ReconciliationReport {
    /// True when the pass found nothing to repair
    ///
    /// Routine uploads of pending locations do not count as repairs.
    pub fn is_clean(&self) -> bool {
        self.resolved_orphans == 0
            && self.demoted_dangling == 0
            && self.restored_local == 0
            && self.removed_temp_files == 0
            && self.permanent_failures.is_empty()
            && self.warnings.is_empty()
    }

    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }
}

pub struct SyncReconciler {
    store: Arc<LocalBlobStore>,
    cloud: Option<Arc<dyn BlobBackend>>,
    ledger: Arc<Ledger>,
    config: ReconcileConfig,
    retry_budget: u32,
}

impl SyncReconciler {
    pub fn new(
        store: Arc<LocalBlobStore>,
        cloud: Option<Arc<dyn BlobBackend>>,
        ledger: Arc<Ledger>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            store,
            cloud,
            ledger,
            config,
            retry_budget: DEFAULT_RETRY_BUDGET,
        }
    }

    /// Upload attempts allowed per cloud location (`max_failed_retries`)
    ///
    /// Used as given: a budget of 0 reports every queued location as a
    /// permanent failure without uploading it.
    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = budget;
        self
    }

    /// Run one full pass
    pub async fn reconcile(&self) -> Result<ReconciliationReport> {
        let mut report = ReconciliationReport::default();

        self.scan_dangling(&mut report).await?;
        self.scan_orphans(&mut report).await?;
        if self.cloud.is_some() {
            self.retry_uploads(&mut report).await?;
        }

        match self
            .store
            .remove_stale_temp_files(self.config.stale_temp_after())
            .await
        {
            Ok(removed) => report.removed_temp_files = removed,
            Err(e) => report.warn(format!("temp cleanup failed: {}", e)),
        }

        info!(
            resolved_orphans = report.resolved_orphans,
            demoted_dangling = report.demoted_dangling,
            restored_local = report.restored_local,
            retried_uploads = report.retried_uploads,
            permanent_failures = report.permanent_failures.len(),
            removed_temp_files = report.removed_temp_files,
            warnings = report.warnings.len(),
            "Reconciliation pass finished"
        );
        Ok(report)
    }

    /// Reconcile every `interval` until `cancel` fires
    pub async fn run_periodic(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Reconciler stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile().await {
                        error!(error = %e, "Reconciliation pass failed");
                    }
                }
            }
        }
    }

    async fn scan_dangling(&self, report: &mut ReconciliationReport) -> Result<()> {
        for (id, location) in self.ledger.records_with_local_location().await? {
            let healthy = match self.local_blob_is_healthy(&id).await {
                Ok(healthy) => healthy,
                Err(e) => {
                    report.warn(format!("cannot check local blob {}: {}", id.short(), e));
                    continue;
                }
            };

            if healthy {
                if !location.sync_state.is_synced() {
                    // The blob came back (copied in by hand, or re-ingested elsewhere)
                    self.ledger
                        .update_location(&id, Backend::Local, &self.store.locate(&id), SyncState::Synced)
                        .await?;
                    report.restored_local += 1;
                }
                continue;
            }

            if self.restore_from_cloud(&id, report).await {
                report.restored_local += 1;
                continue;
            }

            if location.sync_state.is_synced() {
                self.ledger
                    .record_location_failure(&id, Backend::Local, "local blob missing or corrupt")
                    .await?;
                report.demoted_dangling += 1;
                warn!(hash = %id, "Demoted dangling local location");
            }
        }
        Ok(())
    }

    /// Present and, with `verify_hashes`, matching its id; corrupt blobs are quarantined
    async fn local_blob_is_healthy(&self, id: &ContentId) -> Result<bool> {
        if !self.store.probe(id).await? {
            return Ok(false);
        }
        if !self.config.verify_hashes || self.store.verify(id).await? {
            return Ok(true);
        }
        self.store.quarantine(id).await?;
        Ok(false)
    }

    /// Pull a blob back from a synced cloud copy
    async fn restore_from_cloud(&self, id: &ContentId, report: &mut ReconciliationReport) -> bool {
        let Some(cloud) = &self.cloud else {
            return false;
        };
        let cloud_synced = match self.ledger.lookup(id).await {
            Ok(Some(record)) => record
                .location(Backend::Cloud)
                .map(|l| l.sync_state.is_synced())
                .unwrap_or(false),
            Ok(None) => false,
            Err(e) => {
                report.warn(format!("cannot load record {}: {}", id.short(), e));
                false
            }
        };
        if !cloud_synced {
            return false;
        }

        let restored = async {
            let bytes = cloud.get(id).await?;
            self.store.put(id, bytes).await?;
            self.ledger
                .update_location(id, Backend::Local, &self.store.locate(id), SyncState::Synced)
                .await
        }
        .await;

        match restored {
            Ok(()) => {
                info!(hash = %id, "Restored local blob from cloud");
                true
            }
            Err(e) => {
                report.warn(format!("restore of {} from cloud failed: {}", id.short(), e));
                false
            }
        }
    }

    async fn scan_orphans(&self, report: &mut ReconciliationReport) -> Result<()> {
        let known: HashSet<ContentId> = self.ledger.all_ids().await?.into_iter().collect();
        let on_disk = self.store.list_blob_ids().await?;

        let grace = self.config.orphan_grace();

        for id in on_disk.into_iter().filter(|id| !known.contains(id)) {
            // A fresh blob may be an ingestion between Persist and LedgerCommit
            match self.store.blob_age(&id).await {
                Ok(Some(age)) if age >= grace => {}
                Ok(Some(age)) => {
                    debug!(hash = %id, age_secs = age.as_secs(), "Orphan inside grace window, skipped");
                    continue;
                }
                Ok(None) => continue,
                Err(e) => {
                    report.warn(format!("cannot stat orphan {}: {}", id.short(), e));
                    continue;
                }
            }

            match self.relink_orphan(&id, report).await {
                Ok(true) => {
                    report.resolved_orphans += 1;
                    info!(hash = %id, "Re-linked orphan blob");
                }
                Ok(false) => {}
                Err(e) => report.warn(format!("orphan {} not re-linked: {}", id.short(), e)),
            }
        }
        Ok(())
    }

    async fn relink_orphan(&self, id: &ContentId, report: &mut ReconciliationReport) -> Result<bool> {
        // Orphans come from crashes; check the bytes before trusting the name
        if !self.store.verify(id).await? {
            self.store.quarantine(id).await?;
            report.warn(format!("orphan {} failed verification and was quarantined", id.short()));
            return Ok(false);
        }

        let sidecar = match read_sidecar(self.store.root(), id).await {
            Ok(sidecar) => sidecar,
            Err(e) => {
                report.warn(format!("unreadable sidecar for {}: {}", id.short(), e));
                None
            }
        };

        let local = Location::new(Backend::Local, self.store.locate(id), SyncState::Synced);
        let delta = match sidecar {
            Some(record) => delta_from_sidecar(record, local),
            None => {
                let size = tokio::fs::metadata(self.store.blob_path(id))
                    .await
                    .map(|m| m.len())
                    .map_err(|e| {
                        AppError::storage_error(
                            format!("Failed to stat orphan: {}", e),
                            Some(self.store.blob_path(id)),
                        )
                    })?;
                unknown_origin_delta(id, size, local)
            }
        };

        self.ledger.upsert(id, delta).await?;

        if let Some(cloud) = &self.cloud {
            self.ledger
                .enqueue_location(id, Backend::Cloud, &cloud.locate(id))
                .await?;
        }
        Ok(true)
    }

    async fn retry_uploads(&self, report: &mut ReconciliationReport) -> Result<()> {
        let Some(cloud) = &self.cloud else {
            return Ok(());
        };

        for (id, location) in self.ledger.records_with_cloud_state().await? {
            let attempts = location.sync_state.retry_count();
            if attempts >= self.retry_budget {
                report.permanent_failures.push(PermanentSyncFailure {
                    content_id: id.clone(),
                    backend: Backend::Cloud,
                    attempts,
                    last_error: location.last_error.clone(),
                });
                continue;
            }

            let upload = async {
                let bytes = self.source_bytes(&id).await?;
                cloud.put(&id, bytes).await
            }
            .await;

            match upload {
                Ok(outcome) => {
                    self.ledger
                        .update_location(&id, Backend::Cloud, &cloud.locate(&id), SyncState::Synced)
                        .await?;
                    report.retried_uploads += 1;
                    debug!(hash = %id, outcome = ?outcome, "Cloud location synced");
                }
                Err(e) => {
                    let message = e.to_string();
                    let count = self
                        .ledger
                        .record_location_failure(&id, Backend::Cloud, &message)
                        .await?;
                    if count >= self.retry_budget {
                        let failure = PermanentSyncFailure {
                            content_id: id.clone(),
                            backend: Backend::Cloud,
                            attempts: count,
                            last_error: Some(message),
                        };
                        error!(hash = %id, attempts = count, error = %failure.to_error(), "Cloud sync gave up");
                        report.permanent_failures.push(failure);
                    }
                }
            }
        }
        Ok(())
    }

    /// Bytes for an upload: the local blob, else a verified legacy copy
    async fn source_bytes(&self, id: &ContentId) -> Result<Bytes> {
        match self.store.get(id).await {
            Ok(bytes) => return Ok(bytes),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let legacy = self
            .ledger
            .lookup(id)
            .await?
            .and_then(|record| record.location(Backend::Legacy).cloned())
            .filter(|location| location.sync_state.is_synced())
            .ok_or_else(|| AppError::not_found(format!("no readable copy of {}", id)))?;

        let bytes = tokio::fs::read(&legacy.path_or_url).await.map_err(|e| {
            AppError::read_error(
                format!("Failed to read legacy copy: {}", e),
                Some(legacy.path_or_url.clone().into()),
            )
        })?;
        let actual = hash_bytes(&bytes);
        if actual != *id {
            return Err(AppError::corruption(id.as_str(), actual.as_str()));
        }
        debug!(hash = %id, path = %legacy.path_or_url, "Uploading from legacy copy");
        Ok(Bytes::from(bytes))
    }
}

fn delta_from_sidecar(record: FileRecord, local: Location) -> FileDelta {
    let mut locations = vec![local];
    locations.extend(
        record
            .locations
            .into_iter()
            .filter(|l| l.backend == Backend::Legacy),
    );

    FileDelta {
        size: record.size,
        mime_type: record.mime_type,
        original_filename: record.original_filename,
        file_extension: record.file_extension,
        created_at: record.created_at,
        modified_at: record.modified_at,
        original_source: record.original_source,
        original_paths: record.original_paths,
        tags: record.tags,
        metadata: record.metadata,
        locations,
    }
}

fn unknown_origin_delta(id: &ContentId, size: u64, local: Location) -> FileDelta {
    let path = shard::shard_path(id).to_string_lossy().into_owned();
    FileDelta {
        size,
        original_filename: id.to_string(),
        original_source: UNKNOWN_ORIGIN.to_string(),
        original_paths: vec![OriginalPath::new(path, UNKNOWN_ORIGIN)],
        locations: vec![local],
        ..Default::default()
    }
}
