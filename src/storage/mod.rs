//! Content-addressable storage
//!
//! Blobs are named by the SHA-256 of their bytes and sharded two levels
//! deep so no directory grows past a few thousand entries:
//!
//! ```text
//! <vault>/
//! ├── ledger.db                    # SQLite ledger (WAL)
//! └── storage/
//!     ├── .staging/                # spooled streams, not yet hashed
//!     └── a3/
//!         └── f2/
//!             ├── a3f2e1d4...      # blob
//!             └── a3f2e1d4....meta.json
//! ```
//!
//! The ledger is the source of truth for provenance; the sidecar JSON is a
//! best-effort copy that lets the reconciler rebuild a lost ledger row.

pub mod backend;
pub mod cas;
pub mod cloud;
pub mod hasher;
pub mod ledger;
pub mod shard;
pub mod sidecar;

pub use backend::{BlobBackend, PutOutcome};
pub use cas::{LocalBlobStore, StagedBlob};
pub use cloud::{CloudBlobStore, InMemoryObjectStore, MountedBucket, ObjectStoreClient};
pub use hasher::{hash_bytes, hash_file, hash_reader, ContentId};
pub use ledger::{
    Ledger, LedgerOptions, LedgerStats, ListSort, SearchFilter, UpsertOutcome,
};
pub use sidecar::{read_sidecar, write_sidecar};
