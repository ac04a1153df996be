//! filevault: a personal content-addressable file vault
//!
//! Files are stored once by SHA-256, every place a copy was seen is kept as
//! provenance in a SQLite ledger, and a reconciler keeps disk, ledger and an
//! optional cloud replica in agreement.

pub mod error;
pub mod infrastructure;
pub mod models;
pub mod monitoring;
pub mod services;
pub mod storage;

pub use error::{AppError, Result};
pub use infrastructure::config::VaultConfig;
pub use models::{Backend, FileRecord, Location, SyncState};
pub use services::{IngestionPipeline, SyncReconciler};
pub use storage::{ContentId, Ledger, LocalBlobStore};
