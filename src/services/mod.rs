pub mod ingest;
pub mod reconciler;
pub mod tagging;

pub use ingest::{
    collect_files, ImportFailure, ImportSummary, IngestOutcome, IngestRequest, IngestStatus,
    IngestionPipeline,
};
pub use reconciler::{PermanentSyncFailure, ReconciliationReport, SyncReconciler};
pub use tagging::{extract_path_tags, TagExtractor, DEFAULT_STOPWORDS};
