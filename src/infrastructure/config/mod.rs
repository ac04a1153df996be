//! Vault configuration
//!
//! Layered, lowest priority first:
//! - built-in defaults (every section implements `Default`)
//! - an optional TOML/JSON file
//! - `FILEVAULT_<SECTION>__<KEY>` environment variables
//!
//! The merged result is checked with `validator` before anything uses it.

use crate::error::{AppError, Result};
use crate::services::tagging::DEFAULT_STOPWORDS;
use crate::storage::backend::BlobBackend;
use crate::storage::cloud::{CloudBlobStore, MountedBucket};
use crate::storage::ledger::LedgerOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use validator::Validate;

pub const ENV_PREFIX: &str = "FILEVAULT";

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct VaultConfig {
    #[validate(nested)]
    pub storage: StorageConfig,

    #[validate(nested)]
    pub ingest: IngestConfig,

    #[validate(nested)]
    pub cloud: CloudConfig,

    #[validate(nested)]
    pub reconcile: ReconcileConfig,

    #[validate(nested)]
    pub logging: LoggingConfig,
}

/// Where the vault lives on disk
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct StorageConfig {
    pub root: PathBuf,

    /// Defaults to `<root>/ledger.db`
    pub ledger_path: Option<PathBuf>,

    #[validate(range(min = 100, max = 600_000))]
    pub busy_timeout_ms: u64,

    #[validate(range(min = 1, max = 64))]
    pub ledger_max_connections: u32,
}

/// Ingestion behaviour
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct IngestConfig {
    /// Mark new content for upload to the cloud backend
    pub cloud_sync_enabled: bool,

    /// Directory names never turned into tags (case-insensitive)
    pub tag_stopwords: Vec<String>,

    /// Upload attempts before a cloud location is reported as permanently failed
    #[validate(range(min = 1, max = 100))]
    pub max_failed_retries: u32,

    pub sidecar_enabled: bool,

    /// Record the source path as a `legacy` location on first sight
    pub track_legacy_locations: bool,

    #[validate(range(min = 1, max = 256))]
    pub max_concurrent_files: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudKind {
    #[default]
    Disabled,
    /// Directory-mounted bucket
    Mounted,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CloudConfig {
    pub kind: CloudKind,

    /// Mount point, required for `mounted`
    pub mount_path: Option<PathBuf>,

    #[validate(length(min = 1, max = 63))]
    pub bucket: String,

    /// Key prefix in front of the shard path
    #[validate(length(max = 256))]
    pub prefix: String,
}

/// Sync reconciler settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Re-hash local blobs during the dangling scan
    pub verify_hashes: bool,

    #[validate(range(min = 1, max = 86_400))]
    pub interval_secs: u64,

    /// Temp files untouched for this long are treated as crash leftovers
    #[validate(range(min = 60))]
    pub stale_temp_after_secs: u64,

    /// Unlinked blobs younger than this may still belong to a running
    /// ingestion and are left for a later pass
    #[validate(range(max = 86_400))]
    pub orphan_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[validate(length(min = 1, max = 256))]
    pub level: String,

    /// When set, a JSON log file rolls daily in this directory
    pub log_dir: Option<PathBuf>,

    #[validate(length(min = 1, max = 64))]
    pub file_prefix: String,

    pub ansi: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./vault"),
            ledger_path: None,
            busy_timeout_ms: 5_000,
            ledger_max_connections: 4,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            cloud_sync_enabled: false,
            tag_stopwords: DEFAULT_STOPWORDS.iter().map(|s| s.to_string()).collect(),
            max_failed_retries: 5,
            sidecar_enabled: true,
            track_legacy_locations: false,
            max_concurrent_files: num_cpus::get().clamp(2, 16),
        }
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            kind: CloudKind::Disabled,
            mount_path: None,
            bucket: "filevault".to_string(),
            prefix: "blobs".to_string(),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            verify_hashes: false,
            interval_secs: 900,
            stale_temp_after_secs: 3_600,
            orphan_grace_secs: 300,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
            file_prefix: "filevault".to_string(),
            ansi: true,
        }
    }
}

impl StorageConfig {
    /// Blob tree root, `<root>/storage`
    pub fn storage_dir(&self) -> PathBuf {
        self.root.join("storage")
    }

    pub fn ledger_file(&self) -> PathBuf {
        self.ledger_path
            .clone()
            .unwrap_or_else(|| self.root.join("ledger.db"))
    }

    pub fn ledger_options(&self) -> LedgerOptions {
        LedgerOptions {
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
            max_connections: self.ledger_max_connections,
        }
    }
}

impl CloudConfig {
    /// The configured cloud backend, or `None` when cloud storage is disabled
    pub fn open_backend(&self) -> Result<Option<Arc<dyn BlobBackend>>> {
        match self.kind {
            CloudKind::Disabled => Ok(None),
            CloudKind::Mounted => {
                let mount = self.mount_path.as_ref().ok_or_else(|| {
                    AppError::config_error("cloud.kind = \"mounted\" requires cloud.mount_path")
                })?;
                let bucket = Arc::new(MountedBucket::new(mount.join(&self.bucket)));
                Ok(Some(Arc::new(CloudBlobStore::new(bucket, self.prefix.clone()))))
            }
        }
    }
}

impl ReconcileConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn stale_temp_after(&self) -> Duration {
        Duration::from_secs(self.stale_temp_after_secs)
    }

    pub fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_secs)
    }
}

impl VaultConfig {
    /// Load defaults, then `path` (if given), then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = ::config::Config::try_from(&VaultConfig::default())
            .map_err(|e| AppError::config_error(format!("Failed to encode defaults: {}", e)))?;

        let mut builder = ::config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("ingest.tag_stopwords"),
        );

        let config: VaultConfig = builder
            .build()
            .map_err(|e| AppError::config_error(e.to_string()))?
            .try_deserialize()
            .map_err(|e| AppError::config_error(e.to_string()))?;

        config.check()?;
        Ok(config)
    }

    /// Field validation plus cross-field rules
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| AppError::config_error(format!("Invalid configuration: {}", e)))?;

        if self.cloud.kind == CloudKind::Mounted && self.cloud.mount_path.is_none() {
            return Err(AppError::config_error(
                "cloud.kind = \"mounted\" requires cloud.mount_path",
            ));
        }
        if self.ingest.cloud_sync_enabled && self.cloud.kind == CloudKind::Disabled {
            return Err(AppError::config_error(
                "ingest.cloud_sync_enabled needs a cloud backend (cloud.kind)",
            ));
        }
        Ok(())
    }

    /// Point the vault at another root; an explicit ledger path is kept
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage.root = root.into();
        self
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| AppError::config_error(format!("Failed to render config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = VaultConfig::default();
        assert!(config.check().is_ok());
        assert_eq!(config.storage.storage_dir(), PathBuf::from("./vault/storage"));
        assert_eq!(config.storage.ledger_file(), PathBuf::from("./vault/ledger.db"));
        assert!(config.ingest.tag_stopwords.contains(&"users".to_string()));
    }

    #[test]
    fn test_load_from_toml_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("vault.toml");
        std::fs::write(
            &path,
            r#"
            [storage]
            root = "/srv/vault"

            [ingest]
            max_failed_retries = 3
            tag_stopwords = ["dropbox"]

            [cloud]
            kind = "mounted"
            mount_path = "/mnt/bucket"
            "#,
        )
        .unwrap();

        let config = VaultConfig::load(Some(&path)).unwrap();
        assert_eq!(config.storage.root, PathBuf::from("/srv/vault"));
        assert_eq!(config.ingest.max_failed_retries, 3);
        assert_eq!(config.ingest.tag_stopwords, vec!["dropbox".to_string()]);
        assert_eq!(config.cloud.kind, CloudKind::Mounted);
        // Untouched keys keep their defaults
        assert!(config.ingest.sidecar_enabled);
        assert_eq!(config.reconcile.interval_secs, 900);
    }

    #[test]
    fn test_environment_overrides_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("vault.toml");
        std::fs::write(&path, "[reconcile]\nstale_temp_after_secs = 120\n").unwrap();

        std::env::set_var("FILEVAULT_RECONCILE__STALE_TEMP_AFTER_SECS", "7200");
        let config = VaultConfig::load(Some(&path));
        std::env::remove_var("FILEVAULT_RECONCILE__STALE_TEMP_AFTER_SECS");

        assert_eq!(config.unwrap().reconcile.stale_temp_after_secs, 7200);
    }

    #[test]
    fn test_range_validation() {
        let mut config = VaultConfig::default();
        config.ingest.max_failed_retries = 0;
        assert!(matches!(config.check(), Err(AppError::Config(_))));

        let mut config = VaultConfig::default();
        config.reconcile.stale_temp_after_secs = 5;
        assert!(config.check().is_err());
    }

    #[test]
    fn test_cross_field_rules() {
        let mut config = VaultConfig::default();
        config.cloud.kind = CloudKind::Mounted;
        assert!(config.check().is_err());

        let mut config = VaultConfig::default();
        config.ingest.cloud_sync_enabled = true;
        assert!(config.check().is_err());
        config.cloud.kind = CloudKind::Mounted;
        config.cloud.mount_path = Some(PathBuf::from("/mnt/bucket"));
        assert!(config.check().is_ok());
    }

    #[test]
    fn test_in_process_bucket_is_not_a_cloud_kind() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("vault.toml");
        std::fs::write(&path, "[cloud]\nkind = \"memory\"\n").unwrap();

        let result = VaultConfig::load(Some(&path));
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn test_cloud_backend_construction() {
        let config = CloudConfig::default();
        assert!(config.open_backend().unwrap().is_none());

        let temp_dir = TempDir::new().unwrap();
        let config = CloudConfig {
            kind: CloudKind::Mounted,
            mount_path: Some(temp_dir.path().to_path_buf()),
            ..Default::default()
        };
        let backend = config.open_backend().unwrap().unwrap();
        assert_eq!(backend.kind(), crate::models::Backend::Cloud);
        assert!(backend.locate(&crate::storage::hash_bytes(b"x")).contains(&config.bucket));

        let config = CloudConfig {
            kind: CloudKind::Mounted,
            mount_path: None,
            ..Default::default()
        };
        assert!(matches!(config.open_backend(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let result = VaultConfig::load(Some(&temp_dir.path().join("absent.toml")));
        assert!(matches!(result, Err(AppError::Config(_))));
    }

    #[test]
    fn test_rendered_toml_loads_back() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("rendered.toml");
        let mut config = VaultConfig::default().with_root(temp_dir.path());
        config.ingest.max_concurrent_files = 3;
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = VaultConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.storage.root, temp_dir.path());
        assert_eq!(loaded.ingest.max_concurrent_files, 3);
    }
}
