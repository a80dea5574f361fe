//! Persistence layer modules.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::{AppError, Result};

pub mod attempt_repo;
pub mod db;
pub mod record_repo;
pub mod recovery;
pub mod schema;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;

/// Fixed-width UTC timestamp so that stored values sort lexically.
pub(crate) fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str, field: &str) -> Result<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid {field}: {e}")))
}

pub(crate) fn parse_opt_ts(raw: Option<&str>, field: &str) -> Result<Option<DateTime<Utc>>> {
    raw.map(|value| parse_ts(value, field)).transpose()
}
