//! End-to-end ingestion against a file-backed ledger


use filevault::models::{Backend, SyncState};
use filevault::services::{collect_files, IngestRequest, IngestStatus};
use filevault::storage::hash_bytes;
use std::sync::Arc;
use vault_test_helpers::create_test_vault;

#[tokio::test]
async fn test_ingesting_same_file_twice_is_idempotent() {
    let vault = create_test_vault().await.unwrap();
    let path = vault.write_source("docs/notes.txt", b"meeting notes").unwrap();
    let pipeline = vault.pipeline();

    let first = pipeline
        .ingest_path(&path, IngestRequest::new(path.to_string_lossy(), "laptop"))
        .await
        .unwrap();
    let second = pipeline
        .ingest_path(&path, IngestRequest::new(path.to_string_lossy(), "laptop"))
        .await
        .unwrap();

    assert_eq!(first.status, IngestStatus::New);
    assert!(first.blob_written);
    assert_eq!(second.status, IngestStatus::Duplicate);
    assert!(!second.blob_written);
    assert_eq!(first.content_id, second.content_id);

    let record = vault.ledger.lookup(&first.content_id).await.unwrap().unwrap();
    assert_eq!(record.original_paths.len(), 1);
    assert_eq!(record.tags, first.record.tags);
    assert_eq!(vault.store.list_blob_ids().await.unwrap(), vec![first.content_id]);
}

#[tokio::test]
async fn test_logo_copy_becomes_alternate_location() {
    let vault = create_test_vault().await.unwrap();
    let pipeline = vault.pipeline();
    let logo: &[u8] = b"\x89PNG\r\n\x1a\n not really a png";

    let first = pipeline
        .ingest_stream(logo, IngestRequest::new("Projects/Site/logo.png", "OldMacDrive"))
        .await
        .unwrap();
    let second = pipeline
        .ingest_stream(logo, IngestRequest::new("Backup/old/logo_copy.png", "ExternalHD"))
        .await
        .unwrap();

    assert_eq!(first.status, IngestStatus::New);
    assert_eq!(second.status, IngestStatus::AlternateLocation);
    assert_eq!(second.content_id, hash_bytes(logo));

    let record = vault.ledger.lookup(&second.content_id).await.unwrap().unwrap();
    let paths: Vec<&str> = record.original_paths.iter().map(|p| p.path.as_str()).collect();
    assert_eq!(paths, vec!["Projects/Site/logo.png", "Backup/old/logo_copy.png"]);

    let tags: Vec<&str> = record.tags.iter().map(String::as_str).collect();
    assert_eq!(tags, vec!["backup", "old", "projects", "site"]);

    // First sighting owns the descriptive fields
    assert_eq!(record.original_filename, "logo.png");
    assert_eq!(record.file_extension, "png");
    assert_eq!(record.mime_type.as_deref(), Some("image/png"));
    assert_eq!(record.original_source, "OldMacDrive");
    assert_eq!(record.sources().into_iter().collect::<Vec<_>>(), vec!["ExternalHD", "OldMacDrive"]);

    let local = record.location(Backend::Local).unwrap();
    assert_eq!(local.sync_state, SyncState::Synced);
    assert_eq!(vault.store.list_blob_ids().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_parallel_ingestion_of_identical_content() {
    let vault = create_test_vault().await.unwrap();
    let pipeline = Arc::new(vault.pipeline());
    let content: &'static [u8] = b"the same bytes from many places";

    let mut handles = Vec::new();
    for i in 0..12 {
        let pipeline = pipeline.clone();
        handles.push(tokio::spawn(async move {
            let request = IngestRequest::new(format!("copies/{}/file.bin", i), "nas");
            pipeline.ingest_stream(content, request).await
        }));
    }

    let mut created = 0;
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        if outcome.status == IngestStatus::New {
            created += 1;
        }
    }
    assert_eq!(created, 1);

    let id = hash_bytes(content);
    let record = vault.ledger.lookup(&id).await.unwrap().unwrap();
    assert_eq!(record.original_paths.len(), 12);
    assert_eq!(vault.store.list_blob_ids().await.unwrap(), vec![id]);
    assert!(vault.store.stale_temp_files(std::time::Duration::ZERO).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_directory_import_summary() {
    let vault = create_test_vault().await.unwrap();
    vault.write_source("photos/a.jpg", b"image a").unwrap();
    vault.write_source("photos/b.jpg", b"image b").unwrap();
    vault.write_source("photos/2019/a_again.jpg", b"image a").unwrap();
    vault.write_source("photos/.DS_Store", b"junk").unwrap();

    let files = collect_files(&vault.sources_dir(), true).unwrap();
    assert_eq!(files.len(), 3);

    let summary = vault
        .pipeline()
        .ingest_many(files.clone(), "camera", &["holiday".to_string()])
        .await;
    assert_eq!(summary.total, 3);
    assert_eq!(summary.new, 2);
    assert_eq!(summary.alternate_location, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.bytes_stored, 14);

    // A second run of the same tree changes nothing
    let again = vault.pipeline().ingest_many(files, "camera", &[]).await;
    assert_eq!(again.duplicate, 3);
    assert_eq!(again.bytes_stored, 0);

    let stats = vault.ledger.stats().await.unwrap();
    assert_eq!(stats.unique_files, 2);
    assert_eq!(stats.total_occurrences, 3);
    assert_eq!(stats.duplicates_avoided(), 1);

    let tagged = vault
        .ledger
        .search(&filevault::storage::SearchFilter {
            tag: Some("holiday".to_string()),
            source: None,
        })
        .await
        .unwrap();
    assert_eq!(tagged.len(), 2);
}

#[tokio::test]
async fn test_cloud_sync_queues_upload_once() {
    let vault = create_test_vault().await.unwrap();
    let pipeline = vault.cloud_pipeline();

    let first = pipeline
        .ingest_stream(&b"for the bucket"[..], IngestRequest::new("a/one.txt", "laptop"))
        .await
        .unwrap();
    let second = pipeline
        .ingest_stream(&b"for the bucket"[..], IngestRequest::new("b/two.txt", "laptop"))
        .await
        .unwrap();

    assert!(first.cloud_enqueued);
    assert!(!second.cloud_enqueued);
    let cloud = second.record.location(Backend::Cloud).unwrap();
    assert_eq!(cloud.sync_state, SyncState::Pending);

    // Nothing is uploaded inline
    assert_eq!(vault.bucket.put_calls(), 0);
}
