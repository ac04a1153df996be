//! SQLite ledger
//!
//! The authoritative index of every content id the vault knows about.
//!
//! ## Database Schema
//!
//! - `files`: one row per content id. Provenance (`original_paths`, `tags`)
//!   and the metadata bag are JSON text columns.
//! - `locations`: one row per `(hash, backend)` with its sync state and
//!   retry bookkeeping.
//! - `vault_meta`: key/value facts about the vault (shard scheme version).
//!
//! ## Concurrency
//!
//! Writers on the same id are serialized twice: an in-process async mutex
//! per id, and a transaction whose first statement is a write, which makes
//! SQLite hand out its write lock before anything is read. The
//! read-merge-write sequence can therefore never interleave with another
//! writer, in this process or another one.

use crate::error::{AppError, Result};
use crate::models::{
    Backend, FileDelta, FileRecord, Location, MetadataBag, MetadataKey, OriginalPath, SyncState,
};
use crate::storage::hasher::ContentId;
use crate::storage::shard::SHARD_SCHEME_VERSION;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Decode, Row, Sqlite, SqlitePool, Type};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Connection settings
#[derive(Debug, Clone)]
pub struct LedgerOptions {
    /// How long a writer waits on SQLite's lock before failing
    pub busy_timeout: Duration,
    pub max_connections: u32,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(5),
            max_connections: 4,
        }
    }
}

/// Result of [`Ledger::upsert`]
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub record: FileRecord,
    /// True when this call created the row
    pub created: bool,
    /// True when this call replaced an unknown-origin placeholder description
    pub adopted: bool,
    pub added_paths: usize,
    pub added_tags: usize,
    pub metadata_conflicts: Vec<MetadataKey>,
}

/// Exact-match filters for [`Ledger::search`]; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub tag: Option<String>,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListSort {
    /// Largest first
    Size,
    /// Most recent import first
    #[default]
    Imported,
}

impl FromStr for ListSort {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "size" => Ok(ListSort::Size),
            "imported" | "date" => Ok(ListSort::Imported),
            other => Err(AppError::validation_error(format!(
                "unknown sort '{}', expected size or imported",
                other
            ))),
        }
    }
}

/// Aggregate numbers for `filevault stats`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub unique_files: u64,
    /// Original paths across all records
    pub total_occurrences: u64,
    pub total_bytes: u64,
    /// Occurrences per source label
    pub by_source: BTreeMap<String, u64>,
    /// Location rows per `backend:state`
    pub by_location_state: BTreeMap<String, u64>,
}

impl LedgerStats {
    /// Occurrences that did not need a new blob
    pub fn duplicates_avoided(&self) -> u64 {
        self.total_occurrences.saturating_sub(self.unique_files)
    }
}

/// Transactional metadata ledger
#[derive(Debug)]
pub struct Ledger {
    pool: SqlitePool,
    key_locks: DashMap<ContentId, Arc<Mutex<()>>>,
}

impl Ledger {
    /// Open (creating if needed) the ledger at `path`
    pub async fn open(path: &Path, options: &LedgerOptions) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                AppError::ledger_error(format!(
                    "Failed to create ledger directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        info!(path = %path.display(), "Opening ledger");

        let connect = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(options.busy_timeout)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(options.max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(connect)
            .await
            .map_err(|e| AppError::ledger_error(format!("Failed to open ledger: {}", e)))?;

        let ledger = Self::from_pool(pool);
        ledger.init_schema().await?;
        Ok(ledger)
    }

    /// Private in-memory ledger
    ///
    /// A single connection that is never recycled, so the database lives as
    /// long as the ledger.
    pub async fn open_in_memory() -> Result<Self> {
        let connect = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| AppError::ledger_error(format!("Invalid in-memory URL: {}", e)))?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect)
            .await
            .map_err(|e| AppError::ledger_error(format!("Failed to open in-memory ledger: {}", e)))?;

        let ledger = Self::from_pool(pool);
        ledger.init_schema().await?;
        Ok(ledger)
    }

    fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            key_locks: DashMap::new(),
        }
    }

    async fn init_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS files (
                hash TEXT PRIMARY KEY NOT NULL,
                size INTEGER NOT NULL,
                mime_type TEXT,
                original_filename TEXT NOT NULL,
                file_extension TEXT NOT NULL,
                created_at TEXT,
                modified_at TEXT,
                imported_at TEXT NOT NULL,
                original_source TEXT NOT NULL,
                original_paths TEXT NOT NULL DEFAULT '[]',
                tags TEXT NOT NULL DEFAULT '[]',
                metadata TEXT NOT NULL DEFAULT '{}'
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS locations (
                hash TEXT NOT NULL REFERENCES files(hash),
                backend TEXT NOT NULL,
                path_or_url TEXT NOT NULL,
                sync_state TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (hash, backend)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_locations_state ON locations(backend, sync_state)",
            "CREATE INDEX IF NOT EXISTS idx_files_source ON files(original_source)",
            "CREATE INDEX IF NOT EXISTS idx_files_imported ON files(imported_at)",
            r#"
            CREATE TABLE IF NOT EXISTS vault_meta (
                key TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| AppError::ledger_error(format!("Failed to initialize schema: {}", e)))?;
        }

        sqlx::query("INSERT OR IGNORE INTO vault_meta (key, value) VALUES ('shard_scheme_version', ?)")
            .bind(SHARD_SCHEME_VERSION.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::ledger_error(format!("Failed to record shard scheme: {}", e)))?;

        let stored: String =
            sqlx::query_scalar("SELECT value FROM vault_meta WHERE key = 'shard_scheme_version'")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| AppError::ledger_error(format!("Failed to read shard scheme: {}", e)))?;
        if stored != SHARD_SCHEME_VERSION.to_string() {
            return Err(AppError::config_error(format!(
                "Ledger uses shard scheme v{}, this build uses v{}; migrate the storage tree first",
                stored, SHARD_SCHEME_VERSION
            )));
        }

        debug!("Ledger schema ready");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn lookup(&self, id: &ContentId) -> Result<Option<FileRecord>> {
        let mut conn = self.acquire().await?;
        fetch_record(&mut conn, id).await
    }

    pub async fn contains(&self, id: &ContentId) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM files WHERE hash = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ledger_err_for("Failed to check record", id, e))?;
        Ok(found.is_some())
    }

    /// Create or merge the record for `id`
    ///
    /// The first call for an id fixes the descriptive fields; every later
    /// call only adds paths, tags, metadata and location updates.
    pub async fn upsert(&self, id: &ContentId, delta: FileDelta) -> Result<UpsertOutcome> {
        self.with_key_lock(id, self.upsert_locked(id, delta)).await
    }

    async fn upsert_locked(&self, id: &ContentId, delta: FileDelta) -> Result<UpsertOutcome> {
        let size = i64::try_from(delta.size)
            .map_err(|_| AppError::validation_error(format!("size {} out of range", delta.size)))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ledger_err_for("Failed to begin transaction", id, e))?;

        // Write first: SQLite grants the write lock here, before any read
        let created = sqlx::query(
            r#"
            INSERT OR IGNORE INTO files (
                hash, size, mime_type, original_filename, file_extension,
                created_at, modified_at, imported_at, original_source
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.as_str())
        .bind(size)
        .bind(&delta.mime_type)
        .bind(&delta.original_filename)
        .bind(&delta.file_extension)
        .bind(delta.created_at)
        .bind(delta.modified_at)
        .bind(Utc::now())
        .bind(&delta.original_source)
        .execute(&mut *tx)
        .await
        .map_err(|e| ledger_err_for("Failed to insert record", id, e))?
        .rows_affected()
            == 1;

        let mut record = fetch_record(&mut tx, id)
            .await?
            .ok_or_else(|| AppError::ledger_error_for("Record vanished inside transaction", id.as_str()))?;

        let stats = record.merge(delta);
        if stats.adopted_description {
            write_description(&mut tx, &record).await?;
        }
        write_provenance(&mut tx, &record).await?;
        for backend in &stats.changed_locations {
            if let Some(location) = record.location(*backend) {
                write_location(&mut tx, id, location).await?;
            }
        }

        tx.commit()
            .await
            .map_err(|e| ledger_err_for("Failed to commit record", id, e))?;

        debug!(
            hash = %id,
            created = created,
            adopted = stats.adopted_description,
            added_paths = stats.added_paths,
            added_tags = stats.added_tags,
            "Ledger upsert committed"
        );

        if !stats.metadata_conflicts.is_empty() {
            debug!(
                hash = %id,
                conflicts = stats.metadata_conflicts.len(),
                "Kept existing metadata values"
            );
        }

        Ok(UpsertOutcome {
            record,
            created,
            adopted: stats.adopted_description,
            added_paths: stats.added_paths,
            added_tags: stats.added_tags,
            metadata_conflicts: stats.metadata_conflicts,
        })
    }

    /// Set the location for one backend
    pub async fn update_location(
        &self,
        id: &ContentId,
        backend: Backend,
        path_or_url: &str,
        state: SyncState,
    ) -> Result<()> {
        if !self.contains(id).await? {
            return Err(AppError::not_found(format!("no ledger record for {}", id)));
        }

        let location = Location::new(backend, path_or_url, state);
        let mut conn = self.acquire().await?;
        write_location(&mut conn, id, &location).await?;

        debug!(hash = %id, backend = %backend, state = %state, "Location updated");
        Ok(())
    }

    /// Add a `Pending` location unless one already exists for the backend
    ///
    /// Returns true when a row was added. Existing rows (including failed
    /// ones with their retry count) are left alone.
    pub async fn enqueue_location(
        &self,
        id: &ContentId,
        backend: Backend,
        path_or_url: &str,
    ) -> Result<bool> {
        if !self.contains(id).await? {
            return Err(AppError::not_found(format!("no ledger record for {}", id)));
        }

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO locations (hash, backend, path_or_url, sync_state, retry_count, updated_at)
            VALUES (?, ?, ?, ?, 0, ?)
            "#,
        )
        .bind(id.as_str())
        .bind(backend.as_str())
        .bind(path_or_url)
        .bind(SyncState::Pending.as_db_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| ledger_err_for("Failed to enqueue location", id, e))?;

        Ok(result.rows_affected() == 1)
    }

    /// Mark a location failed and bump its retry count
    ///
    /// Returns the new retry count.
    pub async fn record_location_failure(
        &self,
        id: &ContentId,
        backend: Backend,
        error: &str,
    ) -> Result<u32> {
        let count: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE locations
            SET sync_state = 'failed',
                retry_count = retry_count + 1,
                last_error = ?,
                updated_at = ?
            WHERE hash = ? AND backend = ?
            RETURNING retry_count
            "#,
        )
        .bind(error)
        .bind(Utc::now())
        .bind(id.as_str())
        .bind(backend.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ledger_err_for("Failed to record location failure", id, e))?;

        let count = count.ok_or_else(|| {
            AppError::not_found(format!("no {} location for {}", backend, id))
        })?;
        let count = u32::try_from(count).unwrap_or(u32::MAX);

        warn!(hash = %id, backend = %backend, retry_count = count, error = error, "Location marked failed");
        Ok(count)
    }

    /// Union `tags` into the record; returns how many were new
    pub async fn add_tags(&self, id: &ContentId, tags: BTreeSet<String>) -> Result<usize> {
        self.with_key_lock(id, async move {
            self.mutate(id, |record| {
                tags.into_iter()
                    .filter(|tag| record.tags.insert(tag.clone()))
                    .count()
            })
            .await
        })
        .await
    }

    /// Merge metadata without overwriting; returns the conflicting keys
    pub async fn merge_metadata(&self, id: &ContentId, bag: MetadataBag) -> Result<Vec<MetadataKey>> {
        self.with_key_lock(id, async move { self.mutate(id, |record| record.metadata.merge(bag)).await })
            .await
    }

    async fn mutate<T>(&self, id: &ContentId, apply: impl FnOnce(&mut FileRecord) -> T) -> Result<T> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ledger_err_for("Failed to begin transaction", id, e))?;

        // No-op write to take the write lock before reading
        let touched = sqlx::query("UPDATE files SET hash = hash WHERE hash = ?")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| ledger_err_for("Failed to lock record", id, e))?
            .rows_affected();
        if touched == 0 {
            return Err(AppError::not_found(format!("no ledger record for {}", id)));
        }

        let mut record = fetch_record(&mut tx, id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("no ledger record for {}", id)))?;
        let result = apply(&mut record);
        write_provenance(&mut tx, &record).await?;

        tx.commit()
            .await
            .map_err(|e| ledger_err_for("Failed to commit record", id, e))?;
        Ok(result)
    }

    /// Cloud locations that are not yet synced, oldest update first
    pub async fn records_with_cloud_state(&self) -> Result<Vec<(ContentId, Location)>> {
        self.locations_where("backend = 'cloud' AND sync_state IN ('pending', 'failed')")
            .await
    }

    /// Every local location, whatever its state
    pub async fn records_with_local_location(&self) -> Result<Vec<(ContentId, Location)>> {
        self.locations_where("backend = 'local'").await
    }

    async fn locations_where(&self, predicate: &'static str) -> Result<Vec<(ContentId, Location)>> {
        let sql = format!(
            "SELECT * FROM locations WHERE {} ORDER BY updated_at, hash",
            predicate
        );
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::ledger_error(format!("Failed to query locations: {}", e)))?;

        rows.iter()
            .map(|row| {
                let hash: String = column(row, "hash")?;
                Ok((parse_id(&hash)?, location_from_row(row)?))
            })
            .collect()
    }

    pub async fn all_ids(&self) -> Result<Vec<ContentId>> {
        let hashes: Vec<String> = sqlx::query_scalar("SELECT hash FROM files ORDER BY hash")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AppError::ledger_error(format!("Failed to list ids: {}", e)))?;
        hashes.iter().map(|h| parse_id(h)).collect()
    }

    /// Records matching every set field of `filter`, most recent import first
    pub async fn search(&self, filter: &SearchFilter) -> Result<Vec<FileRecord>> {
        let mut sql = String::from("SELECT * FROM files WHERE 1 = 1");
        if filter.tag.is_some() {
            sql.push_str(" AND EXISTS (SELECT 1 FROM json_each(files.tags) WHERE value = ?)");
        }
        if filter.source.is_some() {
            sql.push_str(
                " AND EXISTS (SELECT 1 FROM json_each(files.original_paths) \
                 WHERE json_extract(value, '$.source') = ?)",
            );
        }
        sql.push_str(" ORDER BY imported_at DESC, hash");

        let mut query = sqlx::query(&sql);
        if let Some(tag) = &filter.tag {
            query = query.bind(tag.to_lowercase());
        }
        if let Some(source) = &filter.source {
            query = query.bind(source);
        }

        let mut conn = self.acquire().await?;
        let rows = query
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| AppError::ledger_error(format!("Failed to search ledger: {}", e)))?;
        records_from_rows(&mut conn, rows).await
    }

    pub async fn list(&self, limit: u32, sort: ListSort) -> Result<Vec<FileRecord>> {
        let order = match sort {
            ListSort::Size => "size DESC, hash",
            ListSort::Imported => "imported_at DESC, hash",
        };
        let sql = format!("SELECT * FROM files ORDER BY {} LIMIT ?", order);

        let mut conn = self.acquire().await?;
        let rows = sqlx::query(&sql)
            .bind(i64::from(limit))
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| AppError::ledger_error(format!("Failed to list records: {}", e)))?;
        records_from_rows(&mut conn, rows).await
    }

    /// Resolve an abbreviated hash to exactly one record
    pub async fn find_by_prefix(&self, prefix: &str) -> Result<FileRecord> {
        let prefix = prefix.trim().to_ascii_lowercase();
        if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AppError::validation_error(format!(
                "'{}' is not a hash prefix",
                prefix
            )));
        }

        let matches: Vec<String> =
            sqlx::query_scalar("SELECT hash FROM files WHERE hash LIKE ? || '%' ORDER BY hash LIMIT 2")
                .bind(&prefix)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| AppError::ledger_error(format!("Failed to resolve prefix: {}", e)))?;

        match matches.as_slice() {
            [] => Err(AppError::not_found(format!("no record matches '{}'", prefix))),
            [only] => {
                let id = parse_id(only)?;
                self.lookup(&id)
                    .await?
                    .ok_or_else(|| AppError::not_found(format!("no record matches '{}'", prefix)))
            }
            _ => Err(AppError::validation_error(format!(
                "prefix '{}' is ambiguous, add more characters",
                prefix
            ))),
        }
    }

    pub async fn stats(&self) -> Result<LedgerStats> {
        let totals = sqlx::query(
            r#"
            SELECT COUNT(*) AS unique_files,
                   COALESCE(SUM(size), 0) AS total_bytes,
                   COALESCE(SUM(json_array_length(original_paths)), 0) AS total_occurrences
            FROM files
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::ledger_error(format!("Failed to compute stats: {}", e)))?;

        let by_source = sqlx::query(
            r#"
            SELECT json_extract(p.value, '$.source') AS source, COUNT(*) AS occurrences
            FROM files, json_each(files.original_paths) AS p
            GROUP BY source
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::ledger_error(format!("Failed to compute source stats: {}", e)))?;

        let by_state = sqlx::query(
            "SELECT backend, sync_state, COUNT(*) AS n FROM locations GROUP BY backend, sync_state",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::ledger_error(format!("Failed to compute location stats: {}", e)))?;

        let mut stats = LedgerStats {
            unique_files: non_negative(column(&totals, "unique_files")?),
            total_bytes: non_negative(column(&totals, "total_bytes")?),
            total_occurrences: non_negative(column(&totals, "total_occurrences")?),
            ..Default::default()
        };
        for row in &by_source {
            let source: Option<String> = column(row, "source")?;
            stats.by_source.insert(
                source.unwrap_or_else(|| "unknown".to_string()),
                non_negative(column(row, "occurrences")?),
            );
        }
        for row in &by_state {
            let backend: String = column(row, "backend")?;
            let state: String = column(row, "sync_state")?;
            stats
                .by_location_state
                .insert(format!("{}:{}", backend, state), non_negative(column(row, "n")?));
        }
        Ok(stats)
    }

    async fn acquire(&self) -> Result<sqlx::pool::PoolConnection<Sqlite>> {
        self.pool
            .acquire()
            .await
            .map_err(|e| AppError::ledger_error(format!("Failed to acquire connection: {}", e)))
    }

    /// Run `work` while holding the in-process lock for `id`
    async fn with_key_lock<T>(
        &self,
        id: &ContentId,
        work: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        let lock = self
            .key_locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _guard = lock.lock().await;
            work.await
        };

        drop(lock);
        // Only the map's own reference left: nobody is waiting on this id
        self.key_locks
            .remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }
}

async fn fetch_record(conn: &mut SqliteConnection, id: &ContentId) -> Result<Option<FileRecord>> {
    let row = sqlx::query("SELECT * FROM files WHERE hash = ?")
        .bind(id.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| ledger_err_for("Failed to load record", id, e))?;

    match row {
        Some(row) => {
            let locations = fetch_locations(conn, id).await?;
            Ok(Some(record_from_row(&row, locations)?))
        }
        None => Ok(None),
    }
}

async fn fetch_locations(conn: &mut SqliteConnection, id: &ContentId) -> Result<Vec<Location>> {
    let rows = sqlx::query("SELECT * FROM locations WHERE hash = ?")
        .bind(id.as_str())
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| ledger_err_for("Failed to load locations", id, e))?;

    let mut locations = rows
        .iter()
        .map(location_from_row)
        .collect::<Result<Vec<_>>>()?;
    locations.sort_by_key(|l| l.backend);
    Ok(locations)
}

async fn records_from_rows(conn: &mut SqliteConnection, rows: Vec<SqliteRow>) -> Result<Vec<FileRecord>> {
    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let hash: String = column(&row, "hash")?;
        let id = parse_id(&hash)?;
        let locations = fetch_locations(conn, &id).await?;
        records.push(record_from_row(&row, locations)?);
    }
    Ok(records)
}

async fn write_provenance(conn: &mut SqliteConnection, record: &FileRecord) -> Result<()> {
    let id = &record.content_id;
    sqlx::query("UPDATE files SET original_paths = ?, tags = ?, metadata = ? WHERE hash = ?")
        .bind(to_json(&record.original_paths, id)?)
        .bind(to_json(&record.tags, id)?)
        .bind(to_json(&record.metadata, id)?)
        .bind(id.as_str())
        .execute(&mut *conn)
        .await
        .map_err(|e| ledger_err_for("Failed to write provenance", id, e))?;
    Ok(())
}

async fn write_description(conn: &mut SqliteConnection, record: &FileRecord) -> Result<()> {
    let id = &record.content_id;
    sqlx::query(
        r#"
        UPDATE files SET
            mime_type = ?, original_filename = ?, file_extension = ?,
            created_at = ?, modified_at = ?, original_source = ?
        WHERE hash = ?
        "#,
    )
    .bind(&record.mime_type)
    .bind(&record.original_filename)
    .bind(&record.file_extension)
    .bind(record.created_at)
    .bind(record.modified_at)
    .bind(&record.original_source)
    .bind(id.as_str())
    .execute(&mut *conn)
    .await
    .map_err(|e| ledger_err_for("Failed to write description", id, e))?;
    Ok(())
}

async fn write_location(conn: &mut SqliteConnection, id: &ContentId, location: &Location) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO locations (hash, backend, path_or_url, sync_state, retry_count, last_error, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (hash, backend) DO UPDATE SET
            path_or_url = excluded.path_or_url,
            sync_state = excluded.sync_state,
            retry_count = excluded.retry_count,
            last_error = excluded.last_error,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(id.as_str())
    .bind(location.backend.as_str())
    .bind(&location.path_or_url)
    .bind(location.sync_state.as_db_str())
    .bind(i64::from(location.sync_state.retry_count()))
    .bind(&location.last_error)
    .bind(location.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| ledger_err_for("Failed to write location", id, e))?;
    Ok(())
}

fn record_from_row(row: &SqliteRow, locations: Vec<Location>) -> Result<FileRecord> {
    let hash: String = column(row, "hash")?;
    let content_id = parse_id(&hash)?;
    let size: i64 = column(row, "size")?;

    Ok(FileRecord {
        size: non_negative(size),
        mime_type: column(row, "mime_type")?,
        original_filename: column(row, "original_filename")?,
        file_extension: column(row, "file_extension")?,
        created_at: column(row, "created_at")?,
        modified_at: column(row, "modified_at")?,
        imported_at: column(row, "imported_at")?,
        original_source: column(row, "original_source")?,
        original_paths: from_json::<Vec<OriginalPath>>(row, "original_paths", &content_id)?,
        tags: from_json::<BTreeSet<String>>(row, "tags", &content_id)?,
        metadata: from_json::<MetadataBag>(row, "metadata", &content_id)?,
        locations,
        content_id,
    })
}

fn location_from_row(row: &SqliteRow) -> Result<Location> {
    let backend: String = column(row, "backend")?;
    let state: String = column(row, "sync_state")?;
    let updated_at: DateTime<Utc> = column(row, "updated_at")?;

    Ok(Location {
        backend: backend.parse()?,
        path_or_url: column(row, "path_or_url")?,
        sync_state: SyncState::from_db(&state, column(row, "retry_count")?)?,
        last_error: column(row, "last_error")?,
        updated_at,
    })
}

fn column<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T>
where
    T: Decode<'r, Sqlite> + Type<Sqlite>,
{
    row.try_get(name)
        .map_err(|e| AppError::ledger_error(format!("Bad ledger column '{}': {}", name, e)))
}

fn from_json<T: DeserializeOwned>(row: &SqliteRow, name: &str, id: &ContentId) -> Result<T> {
    let text: String = column(row, name)?;
    serde_json::from_str(&text).map_err(|e| {
        AppError::ledger_error_for(format!("Malformed JSON in column '{}': {}", name, e), id.as_str())
    })
}

fn to_json<T: Serialize>(value: &T, id: &ContentId) -> Result<String> {
    serde_json::to_string(value).map_err(|e| {
        AppError::ledger_error_for(format!("Failed to encode provenance: {}", e), id.as_str())
    })
}

fn parse_id(hash: &str) -> Result<ContentId> {
    hash.parse()
        .map_err(|e| AppError::ledger_error(format!("Invalid hash in ledger '{}': {}", hash, e)))
}

fn ledger_err_for(context: &str, id: &ContentId, e: sqlx::Error) -> AppError {
    AppError::ledger_error_for(format!("{}: {}", context, e), id.as_str())
}

fn non_negative(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
