//! Reconciler scenarios: crash leftovers, lost blobs and cloud retries


use bytes::Bytes;
use filevault::models::{Backend, SyncState};
use filevault::services::{IngestRequest, IngestStatus};
use filevault::storage::{hash_bytes, write_sidecar, BlobBackend};
use filevault::AppError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use vault_test_helpers::create_test_vault;

#[tokio::test]
async fn test_orphan_blob_is_relinked_with_unknown_origin() {
    let vault = create_test_vault().await.unwrap();
    let content = Bytes::from_static(b"written, then the process died");
    let id = hash_bytes(&content);
    vault.store.put(&id, content).await.unwrap();

    let report = vault.reconciler(false).reconcile().await.unwrap();
    assert_eq!(report.resolved_orphans, 1);

    let record = vault.ledger.lookup(&id).await.unwrap().unwrap();
    assert_eq!(record.original_source, "unknown-origin");
    assert_eq!(record.original_filename, id.as_str());
    assert_eq!(record.size, 30);
    assert_eq!(
        record.location(Backend::Local).unwrap().sync_state,
        SyncState::Synced
    );

    // Second pass has nothing left to do
    assert!(vault.reconciler(false).reconcile().await.unwrap().is_clean());
}

#[tokio::test]
async fn test_ingest_after_early_relink_keeps_real_provenance() {
    let vault = create_test_vault().await.unwrap();
    let logo: &[u8] = b"\x89PNG\r\n\x1a\n caught mid-ingest";
    let id = hash_bytes(logo);

    // Blob persisted, ledger commit not yet made, reconciler runs in between
    vault.store.put(&id, Bytes::from_static(logo)).await.unwrap();
    let report = vault.reconciler(false).reconcile().await.unwrap();
    assert_eq!(report.resolved_orphans, 1);

    let outcome = vault
        .pipeline()
        .ingest_stream(logo, IngestRequest::new("Projects/Site/logo.png", "OldMacDrive"))
        .await
        .unwrap();
    assert_eq!(outcome.status, IngestStatus::New);
    assert!(!outcome.blob_written);

    let record = vault.ledger.lookup(&id).await.unwrap().unwrap();
    assert_eq!(record.original_filename, "logo.png");
    assert_eq!(record.file_extension, "png");
    assert_eq!(record.mime_type.as_deref(), Some("image/png"));
    assert_eq!(record.original_source, "OldMacDrive");
    let paths: Vec<&str> = record.original_paths.iter().map(|p| p.path.as_str()).collect();
    assert_eq!(paths, vec!["Projects/Site/logo.png"]);
    assert!(record.tags.contains("projects"));
    assert_eq!(
        record.location(Backend::Local).unwrap().sync_state,
        SyncState::Synced
    );

    // A later copy is an ordinary alternate location
    let copy = vault
        .pipeline()
        .ingest_stream(logo, IngestRequest::new("Backup/logo_copy.png", "ExternalHD"))
        .await
        .unwrap();
    assert_eq!(copy.status, IngestStatus::AlternateLocation);
    assert_eq!(copy.record.original_source, "OldMacDrive");
}

#[tokio::test]
async fn test_failed_ledger_commit_leaves_blob_for_reconcile() {
    let vault = create_test_vault().await.unwrap();
    let path = vault.write_source("scans/receipt.pdf", b"receipt 2024-03").unwrap();
    let id = hash_bytes(b"receipt 2024-03");

    // Reads keep working, every update of a record is refused
    let admin = SqlitePool::connect_with(SqliteConnectOptions::new().filename(vault.ledger_path()))
        .await
        .unwrap();
    sqlx::query(
        "CREATE TRIGGER refuse_record_updates BEFORE UPDATE ON files \
         BEGIN SELECT RAISE(ABORT, 'ledger is read-only'); END",
    )
    .execute(&admin)
    .await
    .unwrap();

    let pipeline = vault.pipeline();
    let err = pipeline
        .ingest_path(&path, IngestRequest::new(path.to_string_lossy(), "scanner"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Ledger { .. }));
    assert!(err.is_deferred_repair());
    assert_eq!(vault.store.list_blob_ids().await.unwrap(), vec![id.clone()]);
    assert!(vault.ledger.lookup(&id).await.unwrap().is_none());

    let summary = pipeline.ingest_many(vec![path.clone()], "scanner", &[]).await;
    assert_eq!(summary.deferred, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.failures[0].kind, "ledger");

    sqlx::query("DROP TRIGGER refuse_record_updates")
        .execute(&admin)
        .await
        .unwrap();
    admin.close().await;

    let report = vault.reconciler(false).reconcile().await.unwrap();
    assert_eq!(report.resolved_orphans, 1);
    let record = vault.ledger.lookup(&id).await.unwrap().unwrap();
    assert_eq!(record.size, 15);
    assert_eq!(
        record.location(Backend::Local).unwrap().sync_state,
        SyncState::Synced
    );
}

#[tokio::test]
async fn test_orphan_recovers_provenance_from_sidecar() {
    let vault = create_test_vault().await.unwrap();
    let pipeline = vault.pipeline();
    let outcome = pipeline
        .ingest_stream(
            &b"vacation photo"[..],
            IngestRequest::new("Pictures/Italy/beach.jpg", "OldMacDrive").with_tags(["summer"]),
        )
        .await
        .unwrap();
    let id = outcome.content_id.clone();

    // Simulate a lost ledger: fresh database, same blob tree
    let sidecar_record = outcome.record.clone();
    let fresh = create_test_vault().await.unwrap();
    fresh.store.put(&id, Bytes::from_static(b"vacation photo")).await.unwrap();
    write_sidecar(fresh.store.root(), &sidecar_record).await.unwrap();

    let report = fresh.reconciler(false).reconcile().await.unwrap();
    assert_eq!(report.resolved_orphans, 1);
    assert!(report.warnings.is_empty());

    let record = fresh.ledger.lookup(&id).await.unwrap().unwrap();
    assert_eq!(record.original_source, "OldMacDrive");
    assert_eq!(record.original_filename, "beach.jpg");
    let paths: Vec<&str> = record.original_paths.iter().map(|p| p.path.as_str()).collect();
    assert_eq!(paths, vec!["Pictures/Italy/beach.jpg"]);
    assert!(record.tags.contains("summer"));
    assert!(record.tags.contains("italy"));
}

#[tokio::test]
async fn test_dangling_record_is_demoted_then_healed_by_reingest() {
    let vault = create_test_vault().await.unwrap();
    let path = vault.write_source("docs/report.pdf", b"quarterly numbers").unwrap();
    let pipeline = vault.pipeline();
    let outcome = pipeline
        .ingest_path(&path, IngestRequest::new(path.to_string_lossy(), "laptop"))
        .await
        .unwrap();
    let id = outcome.content_id;

    std::fs::remove_file(vault.store.blob_path(&id)).unwrap();

    let report = vault.reconciler(false).reconcile().await.unwrap();
    assert_eq!(report.demoted_dangling, 1);
    let local = vault
        .ledger
        .lookup(&id)
        .await
        .unwrap()
        .unwrap()
        .location(Backend::Local)
        .cloned()
        .unwrap();
    assert_eq!(local.sync_state, SyncState::Failed { retry_count: 1 });
    assert!(local.last_error.is_some());

    // Same bytes seen again: the blob is rewritten and Local is Synced again
    let again = pipeline
        .ingest_path(&path, IngestRequest::new(path.to_string_lossy(), "laptop"))
        .await
        .unwrap();
    assert_eq!(again.status, IngestStatus::Duplicate);
    assert!(again.blob_written);
    assert!(vault.store.verify(&id).await.unwrap());
    assert_eq!(
        again.record.location(Backend::Local).unwrap().sync_state,
        SyncState::Synced
    );
}

#[tokio::test]
async fn test_cloud_upload_retries_until_budget_exhausted() {
    let vault = create_test_vault().await.unwrap();
    let outcome = vault
        .cloud_pipeline()
        .ingest_stream(&b"offsite copy"[..], IngestRequest::new("a/b.txt", "laptop"))
        .await
        .unwrap();
    let id = outcome.content_id;

    vault.bucket.set_offline(true);
    let reconciler = vault.reconciler(true).with_retry_budget(3);

    for _ in 0..2 {
        let report = reconciler.reconcile().await.unwrap();
        assert_eq!(report.retried_uploads, 0);
        assert!(report.permanent_failures.is_empty());
    }
    let report = reconciler.reconcile().await.unwrap();
    assert_eq!(report.permanent_failures.len(), 1);
    let failure = &report.permanent_failures[0];
    assert_eq!(failure.content_id, id);
    assert_eq!(failure.attempts, 3);
    assert!(matches!(failure.to_error(), AppError::PermanentSyncFailure { .. }));

    let cloud = vault
        .ledger
        .lookup(&id)
        .await
        .unwrap()
        .unwrap()
        .location(Backend::Cloud)
        .cloned()
        .unwrap();
    assert_eq!(cloud.sync_state, SyncState::Failed { retry_count: 3 });
}

#[tokio::test]
async fn test_cloud_upload_recovers_after_transient_failure() {
    let vault = create_test_vault().await.unwrap();
    let outcome = vault
        .cloud_pipeline()
        .ingest_stream(&b"flaky network"[..], IngestRequest::new("x/y.txt", "laptop"))
        .await
        .unwrap();
    let id = outcome.content_id;

    vault.bucket.fail_next(1);
    let reconciler = vault.reconciler(true);

    let first = reconciler.reconcile().await.unwrap();
    assert_eq!(first.retried_uploads, 0);
    let second = reconciler.reconcile().await.unwrap();
    assert_eq!(second.retried_uploads, 1);

    let record = vault.ledger.lookup(&id).await.unwrap().unwrap();
    assert_eq!(
        record.location(Backend::Cloud).unwrap().sync_state,
        SyncState::Synced
    );
    assert_eq!(vault.cloud.get(&id).await.unwrap(), Bytes::from_static(b"flaky network"));
}

#[tokio::test]
async fn test_lost_local_blob_is_restored_from_cloud() {
    let vault = create_test_vault().await.unwrap();
    let outcome = vault
        .cloud_pipeline()
        .ingest_stream(&b"backed up"[..], IngestRequest::new("keep/me.txt", "laptop"))
        .await
        .unwrap();
    let id = outcome.content_id;

    let reconciler = vault.reconciler(true);
    assert_eq!(reconciler.reconcile().await.unwrap().retried_uploads, 1);

    // Bit rot on the local copy
    std::fs::write(vault.store.blob_path(&id), b"backed uq").unwrap();

    let report = reconciler.reconcile().await.unwrap();
    assert_eq!(report.restored_local, 1);
    assert_eq!(report.demoted_dangling, 0);
    assert!(vault.store.verify(&id).await.unwrap());
}
