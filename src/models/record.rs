//! Ledger records
//!
//! A [`FileRecord`] describes one unique piece of content: what it is
//! (size, type), where it has been seen (original paths, tags) and where it
//! is stored (locations). Descriptive fields are fixed at first ingestion;
//! provenance only grows. The one exception is a record the reconciler
//! recovered without provenance: the first real ingestion replaces its
//! placeholder description.

use crate::error::{AppError, Result};
use crate::models::metadata::{MetadataBag, MetadataKey};
use crate::storage::hasher::ContentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Source label for blobs recovered without any provenance
pub const UNKNOWN_ORIGIN: &str = "unknown-origin";

/// Storage backend a location refers to
///
/// Declaration order is the display order of a record's locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Local,
    Cloud,
    Legacy,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Local => "local",
            Backend::Cloud => "cloud",
            Backend::Legacy => "legacy",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(Backend::Local),
            "cloud" => Ok(Backend::Cloud),
            "legacy" => Ok(Backend::Legacy),
            other => Err(AppError::validation_error(format!(
                "unknown backend '{}'",
                other
            ))),
        }
    }
}

/// Replication state of one location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum SyncState {
    Pending,
    Synced,
    Failed { retry_count: u32 },
}

impl SyncState {
    /// Column value for `locations.sync_state`
    pub fn as_db_str(&self) -> &'static str {
        match self {
            SyncState::Pending => "pending",
            SyncState::Synced => "synced",
            SyncState::Failed { .. } => "failed",
        }
    }

    pub fn retry_count(&self) -> u32 {
        match self {
            SyncState::Failed { retry_count } => *retry_count,
            _ => 0,
        }
    }

    pub fn from_db(state: &str, retry_count: i64) -> Result<Self> {
        match state {
            "pending" => Ok(SyncState::Pending),
            "synced" => Ok(SyncState::Synced),
            "failed" => Ok(SyncState::Failed {
                retry_count: u32::try_from(retry_count).unwrap_or(u32::MAX),
            }),
            other => Err(AppError::ledger_error(format!(
                "unknown sync state '{}'",
                other
            ))),
        }
    }

    pub fn is_synced(&self) -> bool {
        matches!(self, SyncState::Synced)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Failed { retry_count } => write!(f, "failed({})", retry_count),
            other => f.write_str(other.as_db_str()),
        }
    }
}

/// One place a blob is (or is supposed to be) stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub backend: Backend,
    pub path_or_url: String,
    pub sync_state: SyncState,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Location {
    pub fn new(backend: Backend, path_or_url: impl Into<String>, sync_state: SyncState) -> Self {
        Self {
            backend,
            path_or_url: path_or_url.into(),
            sync_state,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// A source path this content has been seen at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginalPath {
    pub path: String,
    pub source: String,
    pub discovered_at: DateTime<Utc>,
}

impl OriginalPath {
    pub fn new(path: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            source: source.into(),
            discovered_at: Utc::now(),
        }
    }
}

/// Everything the ledger knows about one content id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub content_id: ContentId,
    pub size: u64,
    pub mime_type: Option<String>,
    pub original_filename: String,
    pub file_extension: String,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    pub imported_at: DateTime<Utc>,
    pub locations: Vec<Location>,
    pub original_paths: Vec<OriginalPath>,
    pub original_source: String,
    pub tags: BTreeSet<String>,
    pub metadata: MetadataBag,
}

/// Changes proposed by one ingestion (or an administrative merge)
#[derive(Debug, Clone, Default)]
pub struct FileDelta {
    pub size: u64,
    pub mime_type: Option<String>,
    pub original_filename: String,
    pub file_extension: String,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    pub original_source: String,
    pub original_paths: Vec<OriginalPath>,
    pub tags: BTreeSet<String>,
    pub metadata: MetadataBag,
    pub locations: Vec<Location>,
}

/// What a merge actually changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub added_paths: usize,
    pub added_tags: usize,
    pub added_metadata: usize,
    pub metadata_conflicts: Vec<MetadataKey>,
    pub changed_locations: Vec<Backend>,
    /// Placeholder description of an unknown-origin record was replaced
    pub adopted_description: bool,
}

impl FileRecord {
    /// First ingestion of a content id
    #[cfg(test)]
    pub(crate) fn from_delta(content_id: ContentId, delta: FileDelta, imported_at: DateTime<Utc>) -> Self {
        let mut record = FileRecord {
            content_id,
            size: delta.size,
            mime_type: delta.mime_type,
            original_filename: delta.original_filename,
            file_extension: delta.file_extension,
            created_at: delta.created_at,
            modified_at: delta.modified_at,
            imported_at,
            locations: Vec::new(),
            original_paths: Vec::new(),
            original_source: delta.original_source,
            tags: BTreeSet::new(),
            metadata: MetadataBag::new(),
        };

        record.merge_provenance(delta.original_paths, delta.tags, delta.metadata, delta.locations);
        record
    }

    /// Merge a later occurrence into an existing record
    ///
    /// Descriptive fields are left untouched unless the record is an
    /// unknown-origin placeholder and the delta carries a real source. Paths,
    /// tags and metadata are unioned; locations in the delta replace the
    /// state for their backend, except `Legacy`, which keeps its first-seen
    /// path.
    pub fn merge(&mut self, delta: FileDelta) -> MergeStats {
        let adopted = self.is_unknown_origin()
            && !delta.original_source.is_empty()
            && delta.original_source != UNKNOWN_ORIGIN;
        if adopted {
            self.mime_type = delta.mime_type;
            self.original_filename = delta.original_filename;
            self.file_extension = delta.file_extension;
            self.created_at = delta.created_at;
            self.modified_at = delta.modified_at;
            self.original_source = delta.original_source;
            self.original_paths.retain(|p| p.source != UNKNOWN_ORIGIN);
        }

        let mut stats =
            self.merge_provenance(delta.original_paths, delta.tags, delta.metadata, delta.locations);
        stats.adopted_description = adopted;
        stats
    }

    /// Recovered from disk with nothing known about where it came from
    pub fn is_unknown_origin(&self) -> bool {
        self.original_source == UNKNOWN_ORIGIN
    }

    fn merge_provenance(
        &mut self,
        paths: Vec<OriginalPath>,
        tags: BTreeSet<String>,
        metadata: MetadataBag,
        locations: Vec<Location>,
    ) -> MergeStats {
        let mut stats = MergeStats::default();

        for path in paths {
            if !self.original_paths.iter().any(|p| p.path == path.path) {
                self.original_paths.push(path);
                stats.added_paths += 1;
            }
        }

        for tag in tags {
            if self.tags.insert(tag) {
                stats.added_tags += 1;
            }
        }

        let before = self.metadata.len();
        stats.metadata_conflicts = self.metadata.merge(metadata);
        stats.added_metadata = self.metadata.len() - before;

        for location in locations {
            if self.upsert_location(location) {
                if let Some(last) = self.locations.last() {
                    stats.changed_locations.push(last.backend);
                }
            }
        }
        self.locations.sort_by_key(|l| l.backend);
        stats.changed_locations.sort();
        stats.changed_locations.dedup();

        stats
    }

    /// Returns true when the location set changed; the changed entry is moved last
    fn upsert_location(&mut self, location: Location) -> bool {
        match self
            .locations
            .iter()
            .position(|l| l.backend == location.backend)
        {
            Some(_) if location.backend == Backend::Legacy => false,
            Some(index) => {
                let existing = &self.locations[index];
                if existing.sync_state == location.sync_state
                    && existing.path_or_url == location.path_or_url
                {
                    return false;
                }
                self.locations.remove(index);
                self.locations.push(location);
                true
            }
            None => {
                self.locations.push(location);
                true
            }
        }
    }

    pub fn location(&self, backend: Backend) -> Option<&Location> {
        self.locations.iter().find(|l| l.backend == backend)
    }

    /// Sources that contributed an original path, deduplicated
    pub fn sources(&self) -> BTreeSet<&str> {
        self.original_paths.iter().map(|p| p.source.as_str()).collect()
    }
}
