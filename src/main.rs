use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

mod config;
mod dav;
mod db;
mod sync;
mod util;

use dav::DavClient;
use sync::index::FileIndex;
use sync::{ReconciliationResult, RetryPolicy, SyncOptions, SyncRunner};

#[derive(Parser)]
#[command(
    name = "davsyncd",
    version,
    about = "WebDAV folder synchronization daemon for Nextcloud/ownCloud-style servers"
)]
struct Cli {
    /// Path to config file [default: ~/.config/davsyncd/config.toml]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the sync daemon (foreground, for systemd)
    Start,
    /// Run one full reconciliation pass and exit
    SyncNow,
    /// Show sync status summary
    Status,
}

fn init_tracing(verbosity: u8) {
    let default_filter = match verbosity {
        0 => "davsyncd=info",
        1 => "davsyncd=debug",
        2 => "davsyncd=trace",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Start => {
            let pool = db::init_db(cfg.general.db_path.as_deref()).await?;
            let index = FileIndex::new(pool.clone());
            let client = DavClient::connect(&cfg.server).await?;
            let runner = SyncRunner::new(client, index).with_retry_policy(RetryPolicy {
                max_attempts: cfg.general.max_retries,
                base_delay: Duration::from_millis(cfg.general.retry_base_delay_ms),
            });

            let cancel = CancellationToken::new();
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

            let interval = cfg.general.full_sync_interval_secs;
            tracing::info!(interval_secs = interval, "davsyncd daemon ready, running initial sync");
            run_all_folders(&runner, &cfg, &cancel).await;

            let mut sync_timer = tokio::time::interval(Duration::from_secs(interval));
            sync_timer.tick().await; // consume the initial instant tick

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("received SIGINT, shutting down");
                        cancel.cancel();
                        break;
                    }

                    _ = sigterm.recv() => {
                        tracing::info!("received SIGTERM, shutting down");
                        cancel.cancel();
                        break;
                    }

                    _ = sync_timer.tick() => {
                        tracing::debug!("periodic full sync");
                        run_all_folders(&runner, &cfg, &cancel).await;
                    }
                }
            }

            tracing::info!("closing database");
            pool.close().await;
            tracing::info!("davsyncd stopped");
        }
        Command::SyncNow => {
            let pool = db::init_db(cfg.general.db_path.as_deref()).await?;
            let index = FileIndex::new(pool.clone());
            let client = DavClient::connect(&cfg.server).await?;
            let runner = SyncRunner::new(client, index).with_retry_policy(RetryPolicy {
                max_attempts: cfg.general.max_retries,
                base_delay: Duration::from_millis(cfg.general.retry_base_delay_ms),
            });

            tracing::info!("running full sync");
            let cancel = CancellationToken::new();
            run_all_folders(&runner, &cfg, &cancel).await;

            pool.close().await;
            println!("sync complete");
        }
        Command::Status => {
            let pool = db::init_db(cfg.general.db_path.as_deref()).await?;
            let index = FileIndex::new(pool.clone());
            print_status(&index, &cfg).await?;
            pool.close().await;
        }
    }

    Ok(())
}

/// Reconcile every configured folder, strictly one at a time; overlapping
/// passes over the same subtree are not safe.
async fn run_all_folders(
    runner: &SyncRunner<DavClient>,
    cfg: &config::Config,
    cancel: &CancellationToken,
) {
    for (i, folder) in cfg.folders.iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        tracing::info!(
            folder = %folder.remote_path,
            "syncing folder {}/{}", i + 1, cfg.folders.len(),
        );

        let opts = SyncOptions {
            recursive: folder.recursive,
            sync_data: folder.sync_data,
        };
        let result = runner.run(&folder.remote_path, &opts, cancel).await;
        report_result(&folder.remote_path, &result);
    }
}

fn report_result(folder: &str, result: &ReconciliationResult) {
    if result.is_success() {
        tracing::info!(
            folder,
            folders = result.folders_synced,
            created = result.created.len(),
            updated = result.updated.len(),
            deleted = result.deleted.len(),
            conflicts = result.conflicted.len(),
            "sync pass complete"
        );
    } else {
        for failure in &result.failed {
            tracing::error!(
                folder = %failure.remote_path,
                error = %failure.error,
                "folder pass failed"
            );
        }
        tracing::warn!(
            folder,
            folders = result.folders_synced,
            failed = result.failed.len(),
            changes = result.change_count(),
            "sync pass finished with failures; unreached folders keep their previous state"
        );
    }
    for conflict in &result.conflicted {
        tracing::warn!(
            path = %conflict.remote_path,
            server_etag = ?conflict.etag_in_conflict,
            "conflict detected, local copy kept awaiting resolution"
        );
    }
}

/// Print a sync status summary from the local index.
async fn print_status(index: &FileIndex, cfg: &config::Config) -> Result<()> {
    let (files, folders) = index.count_records().await?;
    let conflicts = index.get_conflicts().await?;

    println!("davsyncd status");
    println!("===============");
    println!("Tracked: {} files, {} folders", files, folders);

    for folder in &cfg.folders {
        let path = util::path::as_folder_path(&util::path::normalize(&folder.remote_path));
        let rec = index.get_by_path(&path).await?;
        let last_sync = rec.and_then(|r| r.last_sync_for_properties);

        println!();
        println!("Folder: {}", path);
        match last_sync {
            Some(ts) => {
                let when = chrono::DateTime::from_timestamp(ts, 0)
                    .map(|dt| dt.to_rfc3339())
                    .unwrap_or_else(|| ts.to_string());
                println!("  Last sync: {when}");
            }
            None => println!("  Last sync: never"),
        }
    }

    if !conflicts.is_empty() {
        println!();
        println!("Conflicts ({}):", conflicts.len());
        for rec in &conflicts {
            println!(
                "  {} (local etag: {}, server etag: {})",
                rec.remote_path,
                rec.etag.as_deref().unwrap_or("-"),
                rec.etag_in_conflict.as_deref().unwrap_or("-"),
            );
        }
    }

    Ok(())
}
