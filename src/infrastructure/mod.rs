//! Infrastructure layer
//!
//! Configuration loading and validation.

pub mod config;

pub use config::{
    CloudConfig, CloudKind, IngestConfig, LoggingConfig, ReconcileConfig, StorageConfig,
    VaultConfig,
};
