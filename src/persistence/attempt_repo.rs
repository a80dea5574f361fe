//! Append-only attempt audit log.

use std::sync::Arc;

use sqlx::SqliteConnection;

use crate::models::attempt::{AttemptOutcome, AttemptRecord, NewAttempt};
use crate::{AppError, Result};

use super::db::Database;
use super::{parse_ts, ts};

/// Repository for per-attempt audit rows.
#[derive(Clone)]
pub struct AttemptRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct AttemptRow {
    id: i64,
    record_id: i64,
    attempt: i64,
    started_at: String,
    finished_at: String,
    outcome: String,
    error: Option<String>,
}

impl AttemptRow {
    fn into_attempt(self) -> Result<AttemptRecord> {
        let outcome = AttemptOutcome::parse(&self.outcome)
            .ok_or_else(|| AppError::Db(format!("invalid attempt outcome: {}", self.outcome)))?;
        let attempt = u32::try_from(self.attempt)
            .map_err(|_| AppError::Db(format!("invalid attempt number: {}", self.attempt)))?;

        Ok(AttemptRecord {
            id: self.id,
            record_id: self.record_id,
            attempt,
            started_at: parse_ts(&self.started_at, "started_at")?,
            finished_at: parse_ts(&self.finished_at, "finished_at")?,
            outcome,
            error: self.error,
        })
    }
}

/// Insert statement shared with startup recovery, which writes inside its
/// own transaction.
pub(crate) const INSERT_ATTEMPT: &str =
    "INSERT INTO queue_attempt (record_id, attempt, started_at, finished_at, outcome, error)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6)";

impl AttemptRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Append one attempt row.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn insert(&self, attempt: &NewAttempt) -> Result<AttemptRecord> {
        let mut conn = self.db.acquire().await?;
        self.insert_on(&mut conn, attempt).await
    }

    /// [`insert`](Self::insert) on a caller-held connection, inside the same
    /// transaction as the record transition it audits.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn insert_on(
        &self,
        conn: &mut SqliteConnection,
        attempt: &NewAttempt,
    ) -> Result<AttemptRecord> {
        let result = sqlx::query(INSERT_ATTEMPT)
            .bind(attempt.record_id)
            .bind(i64::from(attempt.attempt))
            .bind(ts(attempt.started_at))
            .bind(ts(attempt.finished_at))
            .bind(attempt.outcome.as_str())
            .bind(&attempt.error)
            .execute(&mut *conn)
            .await?;

        Ok(AttemptRecord {
            id: result.last_insert_rowid(),
            record_id: attempt.record_id,
            attempt: attempt.attempt,
            started_at: attempt.started_at,
            finished_at: attempt.finished_at,
            outcome: attempt.outcome,
            error: attempt.error.clone(),
        })
    }

    /// All attempts of one record, in attempt order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_for_record(&self, record_id: i64) -> Result<Vec<AttemptRecord>> {
        let rows: Vec<AttemptRow> = sqlx::query_as(
            "SELECT id, record_id, attempt, started_at, finished_at, outcome, error
             FROM queue_attempt
             WHERE record_id = ?1
             ORDER BY attempt ASC, id ASC",
        )
        .bind(record_id)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(AttemptRow::into_attempt).collect()
    }
}
