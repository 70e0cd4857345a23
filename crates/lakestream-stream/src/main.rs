//! Lakestream stream job.
//!
//! Consumes the durable event log in micro-batches and commits them to a
//! partitioned table in the warehouse.
//!
//! # Usage
//!
//! ```bash
//! # Run until Ctrl+C
//! lakestream-stream run --warehouse ./data/warehouse
//!
//! # Inspect the table history and the job's checkpoint
//! lakestream-stream snapshots
//! lakestream-stream checkpoint
//! ```
//!
//! # Graceful Shutdown
//!
//! On SIGINT (Ctrl+C) the job finishes or aborts the in-flight batch, never
//! committing part of one, releases its consumer-group lease and exits. A
//! fatal error exits non-zero; a supervisor restarts the job from its last
//! checkpoint.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lakestream_core::metrics::{init_metrics, start_metrics_server};
use lakestream_log::{FileLog, FileLogConfig};
use lakestream_stream::{
    CheckpointConfig, CheckpointStore, DedupeIndex, InvalidSink, InvalidSinkConfig, JobConfig,
    LogInvalidSink, ManifestWriter, PartitionSpec, SegmentInvalidSink, StreamJob, Table,
    TableConfig, open_warehouse,
};
use tracing_subscriber::EnvFilter;

/// Stream-to-lakehouse job.
#[derive(Parser, Debug)]
#[command(name = "lakestream-stream")]
#[command(about = "Materialize the event log into a partitioned table")]
#[command(version)]
struct Args {
    /// Warehouse root: a local directory or s3://bucket/prefix
    #[arg(long, global = true, env = "LAKESTREAM_WAREHOUSE", default_value = "./data/warehouse")]
    warehouse: String,

    /// Table namespace
    #[arg(long, global = true, env = "LAKESTREAM_TABLE_NAMESPACE", default_value = "analytics")]
    table_namespace: String,

    /// Table name
    #[arg(long, global = true, env = "LAKESTREAM_TABLE_NAME", default_value = "events")]
    table_name: String,

    /// Job identity (checkpoint location and transaction markers)
    #[arg(long, global = true, env = "LAKESTREAM_JOB_ID", default_value = "events-to-lakehouse")]
    job_id: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the job until interrupted
    Run(RunArgs),

    /// Print the table's snapshot history
    Snapshots,

    /// Print the job's last committed checkpoint
    Checkpoint,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Directory holding the durable log
    #[arg(long, env = "LAKESTREAM_LOG_DIR", default_value = "./data/log")]
    log_dir: PathBuf,

    /// Topic to consume
    #[arg(long, env = "LAKESTREAM_TOPIC", default_value = lakestream_core::DEFAULT_TOPIC)]
    topic: String,

    /// Consumer group
    #[arg(long, env = "LAKESTREAM_GROUP", default_value = "lakestream-stream")]
    group: String,

    /// Pause between micro-batches in milliseconds
    #[arg(long, env = "LAKESTREAM_BATCH_INTERVAL_MS", default_value = "5000")]
    batch_interval_ms: u64,

    /// Records read per micro-batch at most
    #[arg(long, env = "LAKESTREAM_MAX_RECORDS_PER_BATCH", default_value = "10000")]
    max_records_per_batch: usize,

    /// Commit attempts per micro-batch
    #[arg(long, env = "LAKESTREAM_MAX_COMMIT_ATTEMPTS", default_value = "3")]
    max_commit_attempts: u32,

    /// Threads for parsing and validation (default: CPU count)
    #[arg(long, env = "LAKESTREAM_WORKERS")]
    workers: Option<usize>,

    /// RocksDB path of the event_id dedupe index (disabled when unset)
    #[arg(long, env = "LAKESTREAM_DEDUPE_PATH")]
    dedupe_path: Option<PathBuf>,

    /// Directory for invalid-record segments (log only when unset)
    #[arg(long, env = "LAKESTREAM_INVALID_DIR")]
    invalid_dir: Option<PathBuf>,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, env = "LAKESTREAM_METRICS_PORT", default_value = "9092")]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Ok(path) = dotenvy::dotenv() {
        eprintln!("Loaded environment from {}", path.display());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,lakestream_stream=debug".into()),
        )
        .init();

    let args = Args::parse();

    let store = open_warehouse(&args.warehouse)
        .with_context(|| format!("Failed to open warehouse {}", args.warehouse))?;
    let table = Table::open(
        store.clone(),
        TableConfig {
            namespace: args.table_namespace.clone(),
            name: args.table_name.clone(),
            ..Default::default()
        },
    );
    let checkpoints = CheckpointStore::new(store, &args.job_id, CheckpointConfig::default());

    match args.command {
        Command::Run(run_args) => run(&args.job_id, table, checkpoints, run_args).await,
        Command::Snapshots => print_snapshots(&table).await,
        Command::Checkpoint => print_checkpoint(&checkpoints).await,
    }
}

async fn run(job_id: &str, table: Table, checkpoints: CheckpointStore, args: RunArgs) -> Result<()> {
    tracing::info!("Lakestream stream job starting...");

    if args.metrics_port > 0 {
        let handle = init_metrics().context("Failed to install metrics recorder")?;
        start_metrics_server(args.metrics_port, handle)
            .await
            .context("Failed to start metrics server")?;
    }

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        running_clone.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    let log = FileLog::open_existing(FileLogConfig {
        dir: args.log_dir.clone(),
        topic: args.topic.clone(),
        ..Default::default()
    })
    .with_context(|| format!("Failed to open topic {} in {}", args.topic, args.log_dir.display()))?;
    let log = Arc::new(log);

    let (invalid, manifest): (Arc<dyn InvalidSink>, Option<ManifestWriter>) = match &args.invalid_dir {
        Some(dir) => {
            let (tx, rx) = crossbeam_channel::unbounded();
            let sink = SegmentInvalidSink::new(
                InvalidSinkConfig {
                    dir: dir.clone(),
                    ..Default::default()
                },
                Some(tx),
            )
            .with_context(|| format!("Failed to open invalid-records dir {}", dir.display()))?;
            (Arc::new(sink), Some(ManifestWriter::spawn(dir.clone(), rx)))
        }
        None => (Arc::new(LogInvalidSink), None),
    };

    let config = JobConfig {
        job_id: job_id.to_string(),
        group: args.group.clone(),
        batch_interval: Duration::from_millis(args.batch_interval_ms),
        max_records_per_batch: args.max_records_per_batch,
        max_commit_attempts: args.max_commit_attempts,
        workers: args.workers.unwrap_or_else(num_cpus::get),
        partition_spec: PartitionSpec::default(),
        ..Default::default()
    };

    tracing::info!("Configuration:");
    tracing::info!("  Job: {} (group {}, member {})", config.job_id, config.group, config.member);
    tracing::info!("  Log: {} / {}", args.log_dir.display(), args.topic);
    tracing::info!("  Table: {}", table.paths().root());
    tracing::info!("  Batch interval: {:?}", config.batch_interval);
    tracing::info!("  Max records per batch: {}", config.max_records_per_batch);
    tracing::info!("  Workers: {}", config.workers);

    let mut job = StreamJob::new(log.clone(), table, checkpoints, invalid.clone(), config);

    let dedupe = match &args.dedupe_path {
        Some(path) => {
            let index = Arc::new(
                DedupeIndex::open(path)
                    .with_context(|| format!("Failed to open dedupe index at {}", path.display()))?,
            );
            tracing::info!("Dedupe index opened: ~{} keys", index.stats().approximate_keys);
            job = job.with_dedupe(index.clone());
            Some(index)
        }
        None => None,
    };

    let result = job.run(running).await;

    // Seal the last invalid-records segment before the manifest writer exits
    drop(job);
    drop(invalid);
    if let Some(manifest) = manifest {
        manifest.stop();
        manifest.join();
    }
    if let Some(dedupe) = &dedupe {
        if let Err(e) = dedupe.flush() {
            tracing::warn!("Failed to flush dedupe index: {}", e);
        }
        lakestream_core::metrics::set_gauge(
            "dedupe_keys_approximate",
            dedupe.stats().approximate_keys as f64,
        );
    }

    match result {
        Ok(()) => {
            tracing::info!("═══════════════════════════════════════════════════════");
            tracing::info!("SHUTDOWN COMPLETE");
            tracing::info!("═══════════════════════════════════════════════════════");
            Ok(())
        }
        Err(e) => Err(anyhow::Error::new(e).context("Stream job failed")),
    }
}

async fn print_snapshots(table: &Table) -> Result<()> {
    let snapshots = table.snapshots().await?;
    if snapshots.is_empty() {
        println!("No snapshots in {}", table.paths().root());
        return Ok(());
    }

    for snapshot in snapshots {
        let txns: Vec<String> = snapshot
            .stream_txns
            .values()
            .map(|t| format!("{}#{}", t.job_id, t.batch_id))
            .collect();
        println!(
            "{:>6}  {}  +{} rows in {} files  ({} rows, {} columns)  {}",
            snapshot.snapshot_id,
            snapshot.committed_at.to_rfc3339(),
            snapshot.summary.added_rows,
            snapshot.summary.added_files,
            snapshot.summary.total_rows,
            snapshot.schema.columns.len(),
            txns.join(" ")
        );
    }
    Ok(())
}

async fn print_checkpoint(checkpoints: &CheckpointStore) -> Result<()> {
    match checkpoints.load_latest().await? {
        Some(checkpoint) => println!("{}", serde_json::to_string_pretty(&checkpoint)?),
        None => println!("No checkpoint for job {}", checkpoints.job_id()),
    }
    Ok(())
}
