use miette::Diagnostic;
use std::path::PathBuf;
use thiserror::Error;

/**
 * Vault error type - miette diagnostics on top of thiserror
 *
 * Variants follow the ingestion stages: anything raised before the ledger
 * commit leaves no durable state behind, anything after it is repaired by the
 * reconciler.
 */
#[derive(Error, Debug, Diagnostic)]
pub enum AppError {
    #[error("IO error: {0}")]
    #[diagnostic(code(vault::io_error))]
    Io(#[from] std::io::Error),

    #[error("Read error: {message}")]
    #[diagnostic(
        code(vault::read_error),
        help("The source could not be read to the end; nothing was stored")
    )]
    Read {
        message: String,
        path: Option<PathBuf>,
    },

    #[error("Storage error: {message}")]
    #[diagnostic(
        code(vault::storage_error),
        help("Check free space and permissions under the storage root")
    )]
    Storage {
        message: String,
        path: Option<PathBuf>,
    },

    #[error("Corruption detected: expected {expected}, stored bytes hash to {actual}")]
    #[diagnostic(
        code(vault::corruption),
        help("The written bytes were discarded; re-run the import")
    )]
    Corruption { expected: String, actual: String },

    #[error("Ledger error: {message}")]
    #[diagnostic(
        code(vault::ledger_error),
        help("Check that the ledger file is writable; a blob stored before the failure is re-linked by `filevault reconcile`")
    )]
    Ledger {
        message: String,
        content_id: Option<String>,
        /// The blob was already on disk when the ledger failed
        deferred: bool,
    },

    #[error("Cloud error: {message}")]
    #[diagnostic(code(vault::cloud_error))]
    Cloud { message: String, retryable: bool },

    #[error("Permanent sync failure for {content_id} after {attempts} attempts: {last_error}")]
    #[diagnostic(
        code(vault::permanent_sync_failure),
        help("Operator attention required: check the cloud backend, then reset the location")
    )]
    PermanentSyncFailure {
        content_id: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Not found: {0}")]
    #[diagnostic(code(vault::not_found))]
    NotFound(String),

    #[error("Validation error: {0}")]
    #[diagnostic(
        code(vault::validation_error),
        help("Check that your input meets the required format and constraints")
    )]
    Validation(String),

    #[error("Configuration error: {0}")]
    #[diagnostic(code(vault::config_error))]
    Config(String),

    #[error("Operation cancelled: {0}")]
    #[diagnostic(code(vault::cancelled))]
    Cancelled(String),
}

impl AppError {
    pub fn read_error(message: impl Into<String>, path: Option<PathBuf>) -> Self {
        AppError::Read {
            message: message.into(),
            path,
        }
    }

    pub fn storage_error(message: impl Into<String>, path: Option<PathBuf>) -> Self {
        AppError::Storage {
            message: message.into(),
            path,
        }
    }

    pub fn corruption(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        AppError::Corruption {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn ledger_error(message: impl Into<String>) -> Self {
        AppError::Ledger {
            message: message.into(),
            content_id: None,
            deferred: false,
        }
    }

    pub fn ledger_error_for(message: impl Into<String>, content_id: impl Into<String>) -> Self {
        AppError::Ledger {
            message: message.into(),
            content_id: Some(content_id.into()),
            deferred: false,
        }
    }

    pub fn cloud_error(message: impl Into<String>, retryable: bool) -> Self {
        AppError::Cloud {
            message: message.into(),
            retryable,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        AppError::NotFound(message.into())
    }

    pub fn validation_error(message: impl Into<String>) -> Self {
        AppError::Validation(message.into())
    }

    pub fn config_error(message: impl Into<String>) -> Self {
        AppError::Config(message.into())
    }

    /**
     * Attach the content id to a ledger error raised without one
     */
    pub fn with_content_id(self, id: impl Into<String>) -> Self {
        match self {
            AppError::Ledger {
                message,
                content_id: None,
                deferred,
            } => AppError::Ledger {
                message,
                content_id: Some(id.into()),
                deferred,
            },
            other => other,
        }
    }

    /**
     * Mark a ledger failure that happened after the blob reached disk
     *
     * Other variants are returned unchanged.
     */
    pub fn into_deferred(self) -> Self {
        match self {
            AppError::Ledger {
                message,
                content_id,
                ..
            } => AppError::Ledger {
                message,
                content_id,
                deferred: true,
            },
            other => other,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Cloud {
                retryable: true,
                ..
            }
        )
    }

    /**
     * True when the failure left durable data that the reconciler closes later
     */
    pub fn is_deferred_repair(&self) -> bool {
        matches!(self, AppError::Ledger { deferred: true, .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound(_))
    }

    /**
     * Stable label for log fields and import summaries
     */
    pub fn error_kind(&self) -> &'static str {
        match self {
            AppError::Io(_) => "io",
            AppError::Read { .. } => "read",
            AppError::Storage { .. } => "storage",
            AppError::Corruption { .. } => "corruption",
            AppError::Ledger { .. } => "ledger",
            AppError::Cloud { .. } => "cloud",
            AppError::PermanentSyncFailure { .. } => "permanent_sync_failure",
            AppError::NotFound(_) => "not_found",
            AppError::Validation(_) => "validation",
            AppError::Config(_) => "config",
            AppError::Cancelled(_) => "cancelled",
        }
    }
}

/**
 * Crate-wide result type
 */
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_error_creation() {
        let error = AppError::storage_error("disk full", None);
        assert!(matches!(error, AppError::Storage { .. }));

        let error = AppError::validation_error("Invalid input");
        assert!(matches!(error, AppError::Validation(_)));
    }

    #[test]
    fn test_with_content_id_only_fills_missing_id() {
        let error = AppError::ledger_error("locked").with_content_id("abc");
        match error {
            AppError::Ledger { content_id, .. } => assert_eq!(content_id.as_deref(), Some("abc")),
            other => panic!("Expected Ledger variant, got {:?}", other),
        }

        let error = AppError::ledger_error_for("locked", "first").with_content_id("second");
        match error {
            AppError::Ledger { content_id, .. } => {
                assert_eq!(content_id.as_deref(), Some("first"))
            }
            other => panic!("Expected Ledger variant, got {:?}", other),
        }

        // The deferred flag survives attaching an id
        let error = AppError::ledger_error("busy").into_deferred().with_content_id("abc");
        match error {
            AppError::Ledger {
                content_id,
                deferred,
                ..
            } => {
                assert_eq!(content_id.as_deref(), Some("abc"));
                assert!(deferred);
            }
            other => panic!("Expected Ledger variant, got {:?}", other),
        }
    }

    #[rstest]
    #[case(AppError::cloud_error("timeout", true), true, false)]
    #[case(AppError::cloud_error("forbidden", false), false, false)]
    #[case(AppError::ledger_error("busy"), false, false)]
    #[case(AppError::ledger_error("busy").into_deferred(), false, true)]
    #[case(AppError::validation_error("bad").into_deferred(), false, false)]
    #[case(AppError::storage_error("full", None), false, false)]
    #[case(AppError::corruption("aa", "bb"), false, false)]
    fn test_error_classification(
        #[case] error: AppError,
        #[case] retryable: bool,
        #[case] deferred: bool,
    ) {
        assert_eq!(error.is_retryable(), retryable);
        assert_eq!(error.is_deferred_repair(), deferred);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let app_error: AppError = io_error.into();

        assert!(matches!(app_error, AppError::Io(_)));
        assert_eq!(app_error.error_kind(), "io");
    }

    #[test]
    fn test_error_display() {
        let error = AppError::corruption("aaaa", "bbbb");
        let display = format!("{}", error);
        assert!(display.contains("Corruption"));
        assert!(display.contains("aaaa"));
        assert!(display.contains("bbbb"));
    }
}
