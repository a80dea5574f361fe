#![forbid(unsafe_code)]

//! `offline-queue`: drain daemon for the desktop offline mutation queue.
//!
//! Bootstraps configuration and the queue database, registers one HTTP
//! handler per configured channel, recovers orphaned records and drains the
//! queue whenever the server is reachable.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use offline_queue::dispatch::http::HttpHandler;
use offline_queue::drainer::connectivity::spawn_probe;
use offline_queue::drainer::DrainOptions;
use offline_queue::persistence::db;
use offline_queue::{AppError, OfflineQueue, QueueConfig, Result};

const DEFAULT_LOG_FILTER: &str = "offline_queue=info,sqlx=warn";

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "offline-queue", about = "Offline mutation queue drain daemon", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("offline-queue bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let config = QueueConfig::load_from_path(&args.config)?;
    info!(channels = config.channels.len(), "configuration loaded");

    // ── Initialize database ─────────────────────────────
    let db = Arc::new(db::connect(&config.db_path).await?);
    info!(path = %config.db_path.display(), "queue database connected");

    // ── Register channel handlers ───────────────────────
    let client = reqwest::Client::builder()
        .build()
        .map_err(|err| AppError::Http(format!("failed to build http client: {err}")))?;

    let start_online =
        config.connectivity.probe_url.is_none() && config.connectivity.start_online;
    let mut builder = OfflineQueue::builder(Arc::clone(&db))
        .options(DrainOptions::from(&config.drain))
        .start_online(start_online);
    for (name, channel) in &config.channels {
        let handler = HttpHandler::new(
            client.clone(),
            channel.url.clone(),
            channel.bearer_token(),
            config.drain.call_timeout(),
        );
        info!(channel = %name, url = handler.url(), "channel registered");
        builder = builder.register_handler(name.clone(), Arc::new(handler))?;
    }
    if config.channels.is_empty() {
        warn!("no channels configured; queued records will not drain");
    }
    let queue = builder.build();

    // ── Start background tasks ──────────────────────────
    let ct = CancellationToken::new();
    let probe_handle = config.connectivity.probe_url.clone().map(|url| {
        info!(%url, "connectivity probe started");
        spawn_probe(
            client.clone(),
            url,
            config.probe_interval(),
            queue.gate(),
            ct.clone(),
        )
    });
    let drain_handle = queue.spawn(ct.clone());
    info!(online = queue.is_online(), "offline queue ready");

    // ── Wait for shutdown signal ────────────────────────
    let signal = shutdown_signal().await;
    info!(signal, "shutdown signal received; stopping drainer");
    ct.cancel();

    // ── Wait for background tasks ───────────────────────
    let _ = drain_handle.await;
    if let Some(handle) = probe_handle {
        let _ = handle.await;
    }

    match queue.counts(None).await {
        Ok(counts) => info!(
            outstanding = counts.outstanding(),
            dead = counts.dead,
            "offline-queue shut down"
        ),
        Err(err) => warn!(%err, "offline-queue shut down; counts unavailable"),
    }

    Ok(())
}

/// Wait for ctrl-c or SIGTERM and name the one that arrived.
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                return tokio::select! {
                    _ = tokio::signal::ctrl_c() => "ctrl-c",
                    _ = sigterm.recv() => "sigterm",
                };
            }
            Err(err) => warn!(%err, "SIGTERM handler unavailable; waiting for ctrl-c"),
        }
    }

    wait_ctrl_c().await
}

async fn wait_ctrl_c() -> &'static str {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "ctrl-c handler failed; shutting down");
    }
    "ctrl-c"
}

/// Log to stderr, filtered by `RUST_LOG` or `offline_queue=info,sqlx=warn`.
fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let installed = match log_format {
        LogFormat::Text => subscriber.try_init(),
        LogFormat::Json => subscriber.json().try_init(),
    };
    installed.map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))
}
