#![forbid(unsafe_code)]

//! `offline-queue-ctl`: local inspection tool for the offline queue database.
//!
//! Opens the queue database directly and prints JSON. Intended for support
//! staff looking at stuck or dead records on a user's machine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use offline_queue::config::DrainConfig;
use offline_queue::models::record::{QueueRecord, RecordFilter, RecordStatus};
use offline_queue::persistence::attempt_repo::AttemptRepo;
use offline_queue::persistence::db;
use offline_queue::persistence::record_repo::RecordRepo;
use offline_queue::persistence::recovery::recover_stale_orphans;
use offline_queue::{AppError, Result};

/// Ten times the default call timeout.
const DEFAULT_STALE_AFTER_SECONDS: u64 = 300;

#[derive(Debug, Parser)]
#[command(
    name = "offline-queue-ctl",
    about = "Inspect and seed the offline queue database",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the queue database file.
    #[arg(long)]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List records, oldest first.
    List {
        /// Only records of this channel.
        #[arg(long)]
        queue: Option<String>,
        /// Only records in this status (pending, in_progress, success, failed, dead).
        #[arg(long)]
        status: Option<RecordStatus>,
        /// Maximum number of records.
        #[arg(long)]
        limit: Option<u32>,
    },

    /// Show record counts per status.
    Counts {
        /// Only records of this channel.
        #[arg(long)]
        queue: Option<String>,
    },

    /// Show one record with its attempt history.
    Show {
        /// Record id.
        id: i64,
    },

    /// Enqueue a payload by hand.
    Enqueue {
        /// Channel name.
        queue: String,
        /// Payload, sent verbatim to the channel endpoint.
        data: String,
        /// Correlation key; a random UUID when omitted.
        #[arg(long)]
        queue_id: Option<String>,
        /// Higher drains first.
        #[arg(long, default_value_t = 0)]
        priority: i64,
    },

    /// Reset records orphaned by a crashed drainer.
    ///
    /// Safe while the daemon runs: only claims older than `--stale-after-seconds`
    /// are touched, and the daemon bounds each call by its timeout.
    Recover {
        /// Attempt ceiling; orphans at or above it become dead.
        #[arg(long)]
        max_attempts: Option<u32>,
        /// Minimum claim age; keep it above the daemon's call timeout.
        #[arg(long, default_value_t = DEFAULT_STALE_AFTER_SECONDS)]
        stale_after_seconds: u64,
    },
}

fn main() {
    let args = Cli::parse();

    let result = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Io(format!("failed to build tokio runtime: {err}")))
        .and_then(|runtime| runtime.block_on(run(args)));

    match result {
        Ok(output) => match serde_json::to_string_pretty(&output) {
            Ok(text) => println!("{text}"),
            Err(err) => {
                eprintln!("Error: {err}");
                std::process::exit(1);
            }
        },
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(1);
        }
    }
}

async fn run(args: Cli) -> Result<Value> {
    if !args.db.exists() {
        return Err(AppError::NotFound(format!(
            "queue database {}",
            args.db.display()
        )));
    }
    let db = Arc::new(db::connect(&args.db).await?);
    let max_attempts = DrainConfig::default().max_attempts;
    let records = RecordRepo::new(Arc::clone(&db), max_attempts);

    match args.command {
        Command::List {
            queue,
            status,
            limit,
        } => {
            let filter = RecordFilter {
                queue,
                status,
                limit,
            };
            let listed = records.list(&filter).await?;
            Ok(Value::Array(listed.iter().map(record_json).collect()))
        }
        Command::Counts { queue } => {
            let counts = records.counts(queue.as_deref()).await?;
            to_json(&counts)
        }
        Command::Show { id } => {
            let record = records.get(id).await?;
            let attempts = AttemptRepo::new(Arc::clone(&db))
                .list_for_record(id)
                .await?;
            Ok(json!({
                "record": record_json(&record),
                "attempts": to_json(&attempts)?,
            }))
        }
        Command::Enqueue {
            queue,
            data,
            queue_id,
            priority,
        } => {
            let queue_id = queue_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let record = records
                .enqueue(&queue, &queue_id, priority, data.as_bytes())
                .await?;
            Ok(record_json(&record))
        }
        Command::Recover {
            max_attempts: ceiling,
            stale_after_seconds,
        } => {
            let report = recover_stale_orphans(
                &db,
                ceiling.unwrap_or(max_attempts),
                Duration::from_secs(stale_after_seconds),
            )
            .await?;
            to_json(&report)
        }
    }
}

/// Record as JSON with the payload rendered as text instead of a byte array.
fn record_json(record: &QueueRecord) -> Value {
    json!({
        "id": record.id,
        "queue_id": record.queue_id,
        "queue": record.queue,
        "status": record.status,
        "attempts": record.attempts,
        "priority": record.priority,
        "data": record.data_lossy(),
        "created_at": record.created_at,
        "started_at": record.started_at,
        "finished_at": record.finished_at,
        "next_eligible_at": record.next_eligible_at,
        "last_error": record.last_error,
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|err| AppError::Io(format!("failed to encode output: {err}")))
}
