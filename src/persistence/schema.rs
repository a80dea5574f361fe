//! `SQLite` schema bootstrap logic.
//!
//! All definitions use `IF NOT EXISTS` and are safe to re-run on every
//! client startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply the queue tables and indexes to the connected database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS queue_record (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    queue_id         TEXT NOT NULL,
    queue            TEXT NOT NULL,
    status           TEXT NOT NULL CHECK(status IN ('pending','in_progress','success','failed','dead')),
    attempts         INTEGER NOT NULL DEFAULT 0 CHECK(attempts >= 0),
    priority         INTEGER NOT NULL DEFAULT 0,
    data             BLOB NOT NULL,
    created_at       TEXT NOT NULL,
    started_at       TEXT,
    finished_at      TEXT,
    next_eligible_at TEXT,
    last_error       TEXT
);

CREATE TABLE IF NOT EXISTS queue_attempt (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id   INTEGER NOT NULL REFERENCES queue_record(id),
    attempt     INTEGER NOT NULL,
    started_at  TEXT NOT NULL,
    finished_at TEXT NOT NULL,
    outcome     TEXT NOT NULL CHECK(outcome IN ('succeeded','transport_error','rejected','abandoned')),
    error       TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_record_active_key
    ON queue_record(queue, queue_id)
    WHERE status IN ('pending','in_progress','failed');
CREATE INDEX IF NOT EXISTS idx_queue_record_ready
    ON queue_record(status, priority, created_at);
CREATE INDEX IF NOT EXISTS idx_queue_attempt_record ON queue_attempt(record_id);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
