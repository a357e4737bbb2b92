//! mirror-sync CLI
//!
//! Synchronize, inspect and watch the local catalog mirror.

use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mirror_sync::error::{Result, SyncError};
use mirror_sync::storage::queries::{count_records, list_records};
use mirror_sync::storage::{list_sync_status, Storage};
use mirror_sync::sync::{JsonDirRemote, RemoteSource, SyncCoordinator, SyncScheduler, SyncService};
use mirror_sync::types::*;

#[derive(Parser)]
#[command(name = "mirror-sync")]
#[command(about = "Keep a local mirror of a remote catalog in sync")]
#[command(version)]
struct Cli {
    /// Database path
    #[arg(
        long,
        env = "MIRROR_SYNC_DB_PATH",
        default_value = "~/.local/share/mirror-sync/mirror.db"
    )]
    db_path: String,

    /// Storage mode: local (WAL) or cloud-safe
    #[arg(long, env = "MIRROR_SYNC_STORAGE_MODE", default_value = "local")]
    storage_mode: String,

    /// SQLite busy timeout in milliseconds
    #[arg(long, env = "MIRROR_SYNC_BUSY_TIMEOUT_MS", default_value = "5000")]
    busy_timeout_ms: u64,

    /// Remote page size
    #[arg(long, env = "MIRROR_SYNC_PAGE_SIZE", default_value = "100")]
    page_size: u32,

    /// Pause between queued syncs of the same resource, in milliseconds
    #[arg(long, env = "MIRROR_SYNC_QUIESCENCE_MS", default_value = "250")]
    quiescence_ms: u64,

    /// Attempts for contended store transactions
    #[arg(long, env = "MIRROR_SYNC_MAX_ATTEMPTS", default_value = "5")]
    max_attempts: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RemoteArgs {
    /// Directory holding `<resource>.json` exports of the remote catalog
    #[arg(long, env = "MIRROR_SYNC_REMOTE_DIR")]
    remote_dir: Option<String>,

    /// Base URL of the remote catalog API
    #[cfg(feature = "http")]
    #[arg(long, env = "MIRROR_SYNC_REMOTE_URL")]
    remote_url: Option<String>,

    /// HTTP request timeout in seconds
    #[cfg(feature = "http")]
    #[arg(long, default_value = "30")]
    timeout_secs: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Synchronize one resource and print its rows
    Sync {
        /// Resource key (categories, products, tags, attributes)
        resource: String,
        #[command(flatten)]
        remote: RemoteArgs,
        #[arg(long, default_value = "1")]
        page: u32,
        #[arg(long, default_value = "100")]
        per_page: u32,
    },
    /// List mirrored rows without contacting the remote
    List {
        resource: String,
        #[arg(long, default_value = "1")]
        page: u32,
        #[arg(long, default_value = "100")]
        per_page: u32,
        /// Only children of this parent (0 for roots)
        #[arg(long)]
        parent: Option<i64>,
        /// Substring to look for in payloads
        #[arg(short, long)]
        search: Option<String>,
        /// Include soft-deleted rows
        #[arg(long)]
        include_inactive: bool,
    },
    /// Show the last sync of every resource
    Status,
    /// Synchronize every resource periodically until interrupted
    Watch {
        #[command(flatten)]
        remote: RemoteArgs,
        /// Seconds between full syncs
        #[arg(long, default_value = "300")]
        interval: u64,
    },
}

#[cfg(feature = "http")]
fn http_remote(args: &RemoteArgs) -> Result<Option<Arc<dyn RemoteSource>>> {
    match &args.remote_url {
        Some(url) => {
            let remote = mirror_sync::sync::HttpRemote::new(
                url.clone(),
                Duration::from_secs(args.timeout_secs),
            )?;
            Ok(Some(Arc::new(remote)))
        }
        None => Ok(None),
    }
}

#[cfg(not(feature = "http"))]
fn http_remote(_args: &RemoteArgs) -> Result<Option<Arc<dyn RemoteSource>>> {
    Ok(None)
}

fn build_remote(args: &RemoteArgs) -> Result<Arc<dyn RemoteSource>> {
    if let Some(remote) = http_remote(args)? {
        return Ok(remote);
    }

    match &args.remote_dir {
        Some(dir) => Ok(Arc::new(JsonDirRemote::new(
            shellexpand::tilde(dir).to_string(),
        ))),
        None => Err(SyncError::Config(
            "no remote configured (use --remote-dir or MIRROR_SYNC_REMOTE_DIR)".to_string(),
        )),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr, stdout carries JSON output
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    // Expand ~ in path
    let db_path = shellexpand::tilde(&cli.db_path).to_string();
    let storage_mode: StorageMode = cli.storage_mode.parse().map_err(SyncError::Config)?;

    let storage_config = StorageConfig {
        db_path,
        storage_mode,
        busy_timeout_ms: cli.busy_timeout_ms,
    };
    let sync_config = SyncConfig {
        page_size: cli.page_size,
        quiescence_ms: cli.quiescence_ms,
        retry: RetryConfig {
            max_attempts: cli.max_attempts,
            ..Default::default()
        },
        ..Default::default()
    };

    let storage = Storage::open(storage_config)?.with_retry_config(sync_config.retry.clone());

    match cli.command {
        Commands::Sync {
            resource,
            remote,
            page,
            per_page,
        } => {
            let remote = build_remote(&remote)?;
            let coordinator = Arc::new(SyncCoordinator::from_config(&sync_config));
            let service = SyncService::new(storage, coordinator, remote, sync_config);

            let response = service
                .synchronize(&resource, &QueryParams::page(page, per_page))
                .await;
            println!("{}", serde_json::to_string_pretty(&response)?);

            if !response.success {
                std::process::exit(1);
            }
        }

        Commands::List {
            resource,
            page,
            per_page,
            parent,
            search,
            include_inactive,
        } => {
            let params = QueryParams {
                page: Some(page),
                per_page: Some(per_page),
                parent_id: parent,
                search,
                include_inactive,
            };
            let (rows, total) = storage.with_connection(|conn| {
                Ok((
                    list_records(conn, &resource, &params)?,
                    count_records(conn, &resource, include_inactive)?,
                ))
            })?;

            eprintln!("{} of {} rows", rows.len(), total);
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }

        Commands::Status => {
            let statuses = storage.with_connection(list_sync_status)?;
            if statuses.is_empty() {
                println!("No syncs recorded yet");
            }
            for status in statuses {
                let completed = status
                    .last_completed_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                let state = match (&status.last_error, status.degraded) {
                    (_, true) => "degraded",
                    (Some(_), false) => "failed",
                    (None, false) => "ok",
                };
                println!(
                    "{:<12} {:<9} runs={:<5} processed={:<6} deleted={:<6} last={}",
                    status.resource,
                    state,
                    status.run_count,
                    status.last_processed,
                    status.last_deleted,
                    completed
                );
                if let Some(error) = status.last_error {
                    println!("{:<12} error: {}", "", error);
                }
            }
        }

        Commands::Watch { remote, interval } => {
            let remote = build_remote(&remote)?;
            let coordinator = Arc::new(SyncCoordinator::from_config(&sync_config));
            let service = Arc::new(SyncService::new(storage, coordinator, remote, sync_config));

            let scheduler = SyncScheduler::start(service, Duration::from_secs(interval.max(1)));
            tracing::info!(interval_secs = interval, "Watching remote catalog, Ctrl-C to stop");

            tokio::signal::ctrl_c().await?;
            scheduler.stop().await?;
        }
    }

    Ok(())
}
