pub mod metadata;
pub mod record;

pub use metadata::{MetadataBag, MetadataKey};
pub use record::{
    Backend, FileDelta, FileRecord, Location, MergeStats, OriginalPath, SyncState, UNKNOWN_ORIGIN,
};
