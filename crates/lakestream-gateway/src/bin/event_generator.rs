//! Lakestream event generator - posts synthetic shopping sessions to a
//! running gateway at a fixed rate.

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use reqwest::Client;
use serde_json::Value;
use tokio::signal;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use lakestream_gateway::generator::{EventGenerator, GeneratorConfig};

#[derive(Parser, Debug)]
#[command(name = "lakestream-event-generator")]
#[command(about = "Post synthetic user sessions to the ingestion gateway", long_about = None)]
struct Args {
    /// Ingestion endpoint.
    #[arg(long, env = "LAKESTREAM_GENERATOR_URL", default_value = "http://localhost:8080/events")]
    url: String,

    /// Events per second.
    #[arg(long, env = "LAKESTREAM_GENERATOR_RATE", default_value = "10")]
    rate: f64,

    /// Stop after this many events (runs until interrupted if unset).
    #[arg(long, env = "LAKESTREAM_GENERATOR_COUNT")]
    count: Option<u64>,

    /// Seed for reproducible sessions.
    #[arg(long, env = "LAKESTREAM_GENERATOR_SEED")]
    seed: Option<u64>,

    /// Chance a session adds something to the cart.
    #[arg(long, default_value = "0.6")]
    cart_rate: f64,

    /// Chance a cart is checked out.
    #[arg(long, default_value = "0.7")]
    checkout_rate: f64,

    /// Chance a payment succeeds.
    #[arg(long, default_value = "0.85")]
    payment_success_rate: f64,

    /// Per-request timeout in milliseconds.
    #[arg(long, env = "LAKESTREAM_GENERATOR_TIMEOUT_MS", default_value = "10000")]
    timeout_ms: u64,
}

#[derive(Debug, Default)]
struct Tally {
    sent: u64,
    accepted: u64,
    rejected: u64,
    failed: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Ok(path) = dotenvy::dotenv() {
        eprintln!("Loaded environment from {}", path.display());
    }

    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,lakestream_event_generator=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if !(args.rate > 0.0 && args.rate.is_finite()) {
        anyhow::bail!("--rate must be a positive number, got {}", args.rate);
    }
    for (name, p) in [
        ("--cart-rate", args.cart_rate),
        ("--checkout-rate", args.checkout_rate),
        ("--payment-success-rate", args.payment_success_rate),
    ] {
        if !(0.0..=1.0).contains(&p) {
            anyhow::bail!("{name} must be between 0 and 1, got {p}");
        }
    }

    let client = Client::builder()
        .timeout(Duration::from_millis(args.timeout_ms))
        .build()
        .context("Failed to create HTTP client")?;

    let config = GeneratorConfig {
        cart_rate: args.cart_rate,
        checkout_rate: args.checkout_rate,
        payment_success_rate: args.payment_success_rate,
        ..GeneratorConfig::default()
    };
    let mut generator = match args.seed {
        Some(seed) => EventGenerator::seeded(seed, config),
        None => EventGenerator::new(config),
    };

    let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / args.rate));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(url = %args.url, rate = args.rate, count = ?args.count, "starting event generator");

    let mut tally = Tally::default();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    while args.count.is_none_or(|count| tally.sent < count) {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {}
        }

        let event = generator.next_event();
        tally.sent += 1;
        send(&client, &args.url, &event, &mut tally).await;

        if tally.sent % 100 == 0 {
            info!(
                "Sent {} events ({} accepted, {} rejected, {} failed)",
                tally.sent, tally.accepted, tally.rejected, tally.failed
            );
        }
    }

    info!(
        "Generator stopped after {} events ({} accepted, {} rejected, {} failed)",
        tally.sent, tally.accepted, tally.rejected, tally.failed
    );
    Ok(())
}

async fn send(client: &Client, url: &str, event: &Value, tally: &mut Tally) {
    let event_type = event["event_type"].as_str().unwrap_or_default();

    match client.post(url).json(event).send().await {
        Ok(response) if response.status().is_success() => {
            tally.accepted += 1;
            debug!(event_type, status = %response.status(), "event accepted");
        }
        Ok(response) => {
            tally.rejected += 1;
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(event_type, %status, body = %body, "event rejected");
        }
        Err(e) => {
            tally.failed += 1;
            warn!(event_type, error = %e, "failed to send event");
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
