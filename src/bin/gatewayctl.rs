//! `gatewayctl`: exercises `gateway_core`'s public API end to end (reindex,
//! approve/reject review, metrics, transfers) in place of the HTTP surface
//! spec.md §6 defers to an external layer. Mirrors the teacher's
//! `src/receiver/main.rs` CLI conventions (clap derive, `console` styling, a
//! per-session log file).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::{style, Emoji};
use gateway_core::indexer::chunk::ChunkSize;
use gateway_core::indexer::cfind::RemoteScanTarget;
use gateway_core::{GatewayConfig, Gateway};
use std::path::PathBuf;
use tracing::info;
use uuid::Uuid;

static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");

#[derive(Parser)]
#[command(name = "gatewayctl")]
#[command(about = "Operate a DICOM routing/compliance gateway")]
#[command(version = "1.0")]
struct Args {
    /// Root directory holding per-route {incoming,processing,completed,...}
    #[arg(long, default_value = "./gateway-data")]
    data_root: PathBuf,

    /// Path to the SQLite database file backing the Store
    #[arg(long, default_value = "./gateway-data/gateway.sqlite")]
    database_path: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start an indexing job over one of the three ingest paths
    Reindex {
        #[command(subcommand)]
        source: ReindexSource,
    },
    /// Cancel a running reindex job
    CancelReindex {
        job_id: String,
    },
    /// Approve a pending review
    Approve {
        review_id: String,
        user_id: String,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Reject a pending review
    Reject {
        review_id: String,
        user_id: String,
        reason: String,
    },
    /// Print rolled-up transfer metrics
    Metrics {
        #[arg(long)]
        ae_title: Option<String>,
        /// One of "minute", "hour", "day"
        #[arg(long, default_value = "minute")]
        resolution: String,
    },
    /// Print active and recent transfers
    Transfers {
        #[arg(long)]
        ae_title: Option<String>,
    },
}

#[derive(Subcommand)]
enum ReindexSource {
    /// Walk a filesystem tree and index every DICOM file found
    Filesystem {
        root: PathBuf,
        source_route: String,
    },
    /// Index a subtree, naming it as a destination rather than a source route
    Subtree {
        root: PathBuf,
        destination_name: String,
        #[arg(long)]
        clear_index_first: bool,
    },
    /// Scan a remote AE via chunked C-FIND
    Remote {
        host: String,
        port: u16,
        called_ae_title: String,
        calling_ae_title: String,
        source_route: String,
        #[arg(long)]
        study_date_from: Option<String>,
        #[arg(long)]
        study_date_to: Option<String>,
        /// One of "hourly", "daily", "weekly", "monthly", "yearly", "none"
        #[arg(long, default_value = "daily")]
        chunk_size: String,
    },
}

fn parse_chunk_size(s: &str) -> ChunkSize {
    match s.to_ascii_lowercase().as_str() {
        "hourly" => ChunkSize::Hourly,
        "weekly" => ChunkSize::Weekly,
        "monthly" => ChunkSize::Monthly,
        "yearly" => ChunkSize::Yearly,
        "none" => ChunkSize::None,
        _ => ChunkSize::Daily,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let session_id = Uuid::new_v4().to_string();
    std::fs::create_dir_all("logs")?;
    let log_file = format!("logs/gatewayctl_{session_id}.log");
    tracing_subscriber::fmt()
        .with_writer(std::fs::File::create(&log_file).context("opening log file")?)
        .init();

    println!("{}gatewayctl", GEAR);
    println!("Session ID: {}", style(&session_id).cyan());
    println!("Data root: {}", style(args.data_root.display()).green());
    info!("gatewayctl starting, data_root={}", args.data_root.display());

    let config = GatewayConfig::new(args.data_root.clone(), args.database_path.clone());
    let gateway = Gateway::new(config).await.context("initializing gateway")?;
    gateway.spawn_background_tasks();

    match args.command {
        Command::Reindex { source } => run_reindex(&gateway, source).await?,
        Command::CancelReindex { job_id } => {
            let cancelled = gateway.indexer.cancel_job(&job_id).await;
            println!("cancelled: {cancelled}");
        }
        Command::Approve { review_id, user_id, notes } => {
            let approved = gateway.review.approve_review(&review_id, &user_id, notes).await?;
            println!("approved: {approved}");
        }
        Command::Reject { review_id, user_id, reason } => {
            let rejected = gateway.review.reject_review(&review_id, &user_id, &reason).await?;
            println!("rejected: {rejected}");
        }
        Command::Metrics { ae_title, resolution } => print_metrics(&gateway, ae_title, &resolution).await,
        Command::Transfers { ae_title } => print_transfers(&gateway, ae_title).await,
    }

    Ok(())
}

async fn run_reindex(gateway: &Gateway, source: ReindexSource) -> Result<()> {
    let job_id = match source {
        ReindexSource::Filesystem { root, source_route } => {
            gateway.indexer.start_filesystem_scan(root, source_route).await?
        }
        ReindexSource::Subtree { root, destination_name, clear_index_first } => {
            gateway
                .indexer
                .start_subtree_scan(root, destination_name, clear_index_first)
                .await?
        }
        ReindexSource::Remote {
            host,
            port,
            called_ae_title,
            calling_ae_title,
            source_route,
            study_date_from,
            study_date_to,
            chunk_size,
        } => {
            let target = RemoteScanTarget {
                host,
                port,
                called_ae_title,
                calling_ae_title,
            };
            gateway
                .indexer
                .start_remote_scan(target, source_route, study_date_from, study_date_to, parse_chunk_size(&chunk_size))
                .await?
        }
    };
    println!("started reindex job: {}", style(&job_id).yellow());
    Ok(())
}

async fn print_metrics(gateway: &Gateway, ae_title: Option<String>, resolution: &str) {
    let points = match resolution {
        "hour" => gateway.metrics.hour_points(ae_title.as_deref()).await,
        "day" => gateway.metrics.day_points(ae_title.as_deref()).await,
        _ => gateway.metrics.minute_points(ae_title.as_deref()).await,
    };
    for point in points {
        println!(
            "{} transfers={} success={} failed={} bytes={} files={}",
            point.timestamp_millis, point.transfers, point.successful, point.failed, point.bytes, point.files
        );
    }
}

async fn print_transfers(gateway: &Gateway, ae_title: Option<String>) {
    for record in gateway.tracker.get_active_transfers(ae_title.as_deref()).await {
        println!(
            "{} {} {} status={:?}",
            record.transfer_id, record.ae_title, record.study_uid, record.status
        );
    }
}
