//! Shard path resolution
//!
//! Blob paths are derived from the digest alone:
//!
//! ```text
//! storage/
//!   a3/
//!     f2/
//!       a3f2e1d4c5...   (full digest as file name)
//!       a3f2e1d4c5....meta.json
//! ```
//!
//! Two levels of two hex characters give 65,536 leaf directories. The leaf
//! name is the full digest, so ids that share a prefix never collide.
//!
//! Changing this layout invalidates every stored blob path and requires a
//! migration pass; bump [`SHARD_SCHEME_VERSION`] if that ever happens.

use crate::storage::hasher::{ContentId, CONTENT_ID_LEN};
use std::path::PathBuf;

pub const SHARD_SCHEME_VERSION: u32 = 1;

/// Hex characters per directory level
const LEVEL_WIDTH: usize = 2;
/// Number of directory levels
const LEVELS: usize = 2;

pub const SIDECAR_SUFFIX: &str = ".meta.json";
pub const TEMP_SUFFIX: &str = ".tmp";

/// Directory components for an id, e.g. `["a3", "f2"]`
fn levels(id: &ContentId) -> impl Iterator<Item = &str> {
    let hex = id.as_str();
    (0..LEVELS).map(move |level| &hex[level * LEVEL_WIDTH..(level + 1) * LEVEL_WIDTH])
}

/// Shard directory relative to the storage root
pub fn shard_dir(id: &ContentId) -> PathBuf {
    levels(id).collect()
}

/// Blob path relative to the storage root
pub fn shard_path(id: &ContentId) -> PathBuf {
    shard_dir(id).join(id.as_str())
}

/// Sidecar path relative to the storage root
pub fn sidecar_path(id: &ContentId) -> PathBuf {
    shard_dir(id).join(format!("{}{}", id, SIDECAR_SUFFIX))
}

/// Object key for cloud backends, always `/`-separated
pub fn object_key(prefix: &str, id: &ContentId) -> String {
    let mut parts: Vec<&str> = Vec::with_capacity(LEVELS + 2);
    let prefix = prefix.trim_matches('/');
    if !prefix.is_empty() {
        parts.push(prefix);
    }
    parts.extend(levels(id));
    parts.push(id.as_str());
    parts.join("/")
}

/// Recognise a blob leaf file name
///
/// Temp files and sidecars return `None`.
pub fn parse_blob_file_name(name: &str) -> Option<ContentId> {
    if name.len() != CONTENT_ID_LEN {
        return None;
    }
    name.parse().ok()
}

/// Temp files are named `.<id>.<uuid>.tmp`
pub fn is_temp_file_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(TEMP_SUFFIX)
}
