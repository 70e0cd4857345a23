//! Lakestream Gateway - HTTP ingestion server.
//!
//! Validates incoming events and publishes them to the file-backed durable
//! log, partitioned by `session_id`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::Request;
use clap::Parser;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use lakestream_core::metrics::{init_metrics, start_metrics_server};
use lakestream_gateway::{AppState, Gateway, GatewayConfig, router};
use lakestream_log::{AckLevel, FileLog, FileLogConfig, Producer, ProducerConfig};

/// HTTP ingestion gateway for user-activity events.
#[derive(Parser, Debug)]
#[command(name = "lakestream-gateway")]
#[command(about = "Validate events and publish them to the durable log", long_about = None)]
struct Args {
    /// Server bind address.
    #[arg(long, env = "LAKESTREAM_BIND_ADDR", default_value = "0.0.0.0:8080")]
    bind_addr: String,

    /// Directory holding the durable log.
    #[arg(long, env = "LAKESTREAM_LOG_DIR", default_value = "./data/log")]
    log_dir: PathBuf,

    /// Topic events are published to.
    #[arg(long, env = "LAKESTREAM_TOPIC", default_value = lakestream_core::DEFAULT_TOPIC)]
    topic: String,

    /// Partition count used when the topic is created.
    #[arg(long, env = "LAKESTREAM_PARTITIONS", default_value = "3")]
    partitions: u32,

    /// Acknowledgment level: none, leader or all.
    #[arg(long, env = "LAKESTREAM_ACK_LEVEL", default_value = "leader")]
    ack_level: AckLevel,

    /// Retries after the first publish attempt.
    #[arg(long, env = "LAKESTREAM_MAX_RETRIES", default_value = "5")]
    max_retries: u32,

    /// Initial retry backoff in milliseconds.
    #[arg(long, env = "LAKESTREAM_INITIAL_BACKOFF_MS", default_value = "100")]
    initial_backoff_ms: u64,

    /// Maximum retry backoff in milliseconds.
    #[arg(long, env = "LAKESTREAM_MAX_BACKOFF_MS", default_value = "5000")]
    max_backoff_ms: u64,

    /// Total time budget for delivering one event, in milliseconds.
    #[arg(long, env = "LAKESTREAM_DELIVERY_TIMEOUT_MS", default_value = "30000")]
    delivery_timeout_ms: u64,

    /// Largest accepted request body in bytes.
    #[arg(long, env = "LAKESTREAM_MAX_BODY_BYTES", default_value = "1048576")]
    max_body_bytes: usize,

    /// Prometheus metrics port (0 to disable).
    #[arg(long, env = "LAKESTREAM_METRICS_PORT", default_value = "9091")]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before parsing so it can feed env-backed flags
    if let Ok(path) = dotenvy::dotenv() {
        eprintln!("Loaded environment from {}", path.display());
    }

    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,lakestream_gateway=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if args.metrics_port > 0 {
        let handle = init_metrics().context("Failed to install metrics recorder")?;
        start_metrics_server(args.metrics_port, handle)
            .await
            .context("Failed to start metrics server")?;
    }

    let log = FileLog::open(FileLogConfig {
        dir: args.log_dir.clone(),
        topic: args.topic.clone(),
        partitions: args.partitions,
        ..Default::default()
    })
    .with_context(|| format!("Failed to open log at {}", args.log_dir.display()))?;
    let log = Arc::new(log);

    let producer = Arc::new(Producer::new(
        log.clone(),
        ProducerConfig {
            ack_level: args.ack_level,
            max_retries: args.max_retries,
            initial_backoff: Duration::from_millis(args.initial_backoff_ms),
            max_backoff: Duration::from_millis(args.max_backoff_ms),
            delivery_timeout: Duration::from_millis(args.delivery_timeout_ms),
            ..Default::default()
        },
    ));

    let config = GatewayConfig {
        bind_addr: args.bind_addr.clone(),
        max_body_bytes: args.max_body_bytes,
    };
    let state = AppState::new(Arc::new(Gateway::new(producer.clone())), config);

    let app = router(state).layer(TraceLayer::new_for_http().make_span_with(
        |request: &Request<_>| {
            tracing::span!(
                Level::INFO,
                "http_request",
                method = %request.method(),
                path = %request.uri().path(),
            )
        },
    ));

    let listener = tokio::net::TcpListener::bind(&args.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", args.bind_addr))?;
    tracing::info!(addr = %args.bind_addr, topic = %args.topic, ack = %args.ack_level, "starting gateway");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Draining producer...");
    producer.close().await;
    log.flush().context("Failed to flush log")?;
    tracing::info!("Gateway stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
