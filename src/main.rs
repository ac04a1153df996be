//! filevault command-line entry point
//!
//! Builds the ledger, local store and optional cloud backend from the
//! configuration and hands them to the library services.

use clap::{Parser, Subcommand};
use filevault::infrastructure::config::VaultConfig;
use filevault::monitoring::init_logging;
use filevault::services::{collect_files, IngestionPipeline, SyncReconciler};
use filevault::storage::{BlobBackend, Ledger, ListSort, LocalBlobStore, SearchFilter};
use filevault::{AppError, FileRecord};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "filevault")]
#[command(version, about = "Personal content-addressable file vault")]
struct Cli {
    /// Configuration file (TOML or JSON)
    #[arg(short, long, global = true, env = "FILEVAULT_CONFIG")]
    config: Option<PathBuf>,

    /// Vault root, overrides storage.root
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a file or directory
    Ingest {
        path: PathBuf,

        /// Provenance label recorded with every path
        #[arg(long, default_value = "local")]
        source: String,

        /// Extra tag, repeatable
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Descend into subdirectories
        #[arg(short, long)]
        recursive: bool,

        /// Skip the JSON sidecar next to each blob
        #[arg(long)]
        no_sidecar: bool,

        /// Do not queue new content for cloud upload
        #[arg(long)]
        no_cloud: bool,
    },
    /// Repair drift between disk, ledger and cloud
    Reconcile {
        /// Re-hash every local blob
        #[arg(long)]
        verify: bool,

        /// Keep running every reconcile.interval_secs until interrupted
        #[arg(long)]
        watch: bool,
    },
    /// Find records by exact tag and/or source
    Search {
        #[arg(long)]
        tag: Option<String>,

        #[arg(long)]
        source: Option<String>,
    },
    /// List records
    List {
        #[arg(short, long, default_value_t = 20)]
        limit: u32,

        /// size | imported
        #[arg(long, default_value = "imported")]
        sort: ListSort,
    },
    /// Show one record as JSON
    Info { prefix: String },
    /// Print every known location of a record
    Locate { prefix: String },
    /// Totals across the ledger
    Stats,
    /// Print the effective configuration as TOML
    ConfigInit,
}

/// Long-lived collaborators shared by every command
struct Vault {
    store: Arc<LocalBlobStore>,
    ledger: Arc<Ledger>,
    cloud: Option<Arc<dyn BlobBackend>>,
}

impl Vault {
    async fn open(config: &VaultConfig) -> filevault::Result<Self> {
        let store = Arc::new(LocalBlobStore::new(config.storage.storage_dir()));
        let ledger = Arc::new(
            Ledger::open(&config.storage.ledger_file(), &config.storage.ledger_options()).await?,
        );

        let cloud = config.cloud.open_backend()?;

        Ok(Self {
            store,
            ledger,
            cloud,
        })
    }
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let mut config = VaultConfig::load(cli.config.as_deref())?;
    if let Some(root) = cli.root {
        config = config.with_root(root);
    }

    if let Commands::ConfigInit = cli.command {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    let _log_guard = init_logging(&config.logging)?;
    info!("filevault v{}", env!("CARGO_PKG_VERSION"));

    let vault = Vault::open(&config).await?;
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, finishing in-flight work");
                cancel.cancel();
            }
        });
    }

    let result = run(cli.command, &vault, &config, cancel).await;
    vault.ledger.close().await;
    Ok(result?)
}

async fn run(
    command: Commands,
    vault: &Vault,
    config: &VaultConfig,
    cancel: CancellationToken,
) -> filevault::Result<()> {
    match command {
        Commands::Ingest {
            path,
            source,
            tags,
            recursive,
            no_sidecar,
            no_cloud,
        } => {
            let mut ingest_config = config.ingest.clone();
            if no_sidecar {
                ingest_config.sidecar_enabled = false;
            }
            if no_cloud {
                ingest_config.cloud_sync_enabled = false;
            }

            let mut pipeline =
                IngestionPipeline::new(vault.store.clone(), vault.ledger.clone(), ingest_config)
                    .with_cancellation(cancel);
            if let Some(cloud) = &vault.cloud {
                pipeline = pipeline.with_cloud(cloud.clone());
            }

            let files = collect_files(&path, recursive)?;
            let summary = pipeline.ingest_many(files, &source, &tags).await;

            println!(
                "{} files: {} new, {} alternate location, {} duplicate, {} deferred, {} failed, {} cancelled",
                summary.total,
                summary.new,
                summary.alternate_location,
                summary.duplicate,
                summary.deferred,
                summary.failed,
                summary.cancelled
            );
            for failure in &summary.failures {
                println!("  {} [{}] {}", failure.path.display(), failure.kind, failure.message);
            }
            if summary.deferred > 0 {
                println!("run `filevault reconcile` to link deferred blobs");
            }
        }

        Commands::Reconcile { verify, watch } => {
            let mut reconcile_config = config.reconcile.clone();
            reconcile_config.verify_hashes |= verify;
            let interval = reconcile_config.interval();

            let reconciler = SyncReconciler::new(
                vault.store.clone(),
                vault.cloud.clone(),
                vault.ledger.clone(),
                reconcile_config,
            )
            .with_retry_budget(config.ingest.max_failed_retries);

            if watch {
                reconciler.run_periodic(interval, cancel).await;
                return Ok(());
            }

            let report = reconciler.reconcile().await?;
            println!(
                "orphans re-linked: {}\ndangling demoted: {}\nrestored locally: {}\nuploads: {}\ntemp files removed: {}",
                report.resolved_orphans,
                report.demoted_dangling,
                report.restored_local,
                report.retried_uploads,
                report.removed_temp_files
            );
            for failure in &report.permanent_failures {
                println!("permanent failure: {}", failure.to_error());
            }
            for warning in &report.warnings {
                println!("warning: {}", warning);
            }
        }

        Commands::Search { tag, source } => {
            if tag.is_none() && source.is_none() {
                return Err(AppError::validation_error("search needs --tag or --source"));
            }
            let records = vault.ledger.search(&SearchFilter { tag, source }).await?;
            print_table(&records);
        }

        Commands::List { limit, sort } => {
            print_table(&vault.ledger.list(limit, sort).await?);
        }

        Commands::Info { prefix } => {
            let record = vault.ledger.find_by_prefix(&prefix).await?;
            let json = serde_json::to_string_pretty(&record)
                .map_err(|e| AppError::validation_error(format!("Failed to render record: {}", e)))?;
            println!("{}", json);
        }

        Commands::Locate { prefix } => {
            let record = vault.ledger.find_by_prefix(&prefix).await?;
            for location in &record.locations {
                println!(
                    "{:<7} {:<10} {}",
                    location.backend.as_str(),
                    location.sync_state.to_string(),
                    location.path_or_url
                );
            }
            for original in &record.original_paths {
                println!("{:<7} {:<10} {}", "seen", original.source, original.path);
            }
            let sources: Vec<&str> = record.sources().into_iter().collect();
            println!("sources: {}", sources.join(", "));
        }

        Commands::Stats => {
            let stats = vault.ledger.stats().await?;
            let stored = vault.store.storage_size().await?;
            println!("unique files:       {}", stats.unique_files);
            println!("paths recorded:     {}", stats.total_occurrences);
            println!("duplicates avoided: {}", stats.duplicates_avoided());
            println!("logical bytes:      {}", stats.total_bytes);
            println!("bytes on disk:      {}", stored);
            for (source, count) in &stats.by_source {
                println!("  source {:<20} {}", source, count);
            }
            for (state, count) in &stats.by_location_state {
                println!("  location {:<18} {}", state, count);
            }
        }

        Commands::ConfigInit => print!("{}", config.to_toml_string()?),
    }
    Ok(())
}

fn print_table(records: &[FileRecord]) {
    for record in records {
        println!(
            "{}  {:>12}  {:<24}  {}",
            record.content_id.short(),
            record.size,
            record.original_source,
            record.original_filename
        );
    }
    println!("{} record(s)", records.len());
}
