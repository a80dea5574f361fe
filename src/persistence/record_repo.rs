//! Durable store for queue records.
//!
//! Every state transition is a single conditional `UPDATE ... RETURNING`
//! statement, so concurrent callers can never both win the same transition.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use tracing::{debug, info};

use crate::models::record::{QueueCounts, QueueRecord, RecordFilter, RecordStatus};
use crate::retry::MAX_BACKOFF;
use crate::{AppError, Result};

use super::db::Database;
use super::{parse_opt_ts, parse_ts, ts};

pub(crate) const COLUMNS: &str = "id, queue_id, queue, status, attempts, priority, data, created_at, \
                       started_at, finished_at, next_eligible_at, last_error";

/// Repository for queue records.
#[derive(Clone)]
pub struct RecordRepo {
    db: Arc<Database>,
    max_attempts: u32,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
pub(crate) struct RecordRow {
    id: i64,
    queue_id: String,
    queue: String,
    status: String,
    attempts: i64,
    priority: i64,
    data: Vec<u8>,
    created_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
    next_eligible_at: Option<String>,
    last_error: Option<String>,
}

impl RecordRow {
    pub(crate) fn into_record(self) -> Result<QueueRecord> {
        let status = RecordStatus::parse(&self.status)
            .ok_or_else(|| AppError::Db(format!("invalid record status: {}", self.status)))?;
        let attempts = u32::try_from(self.attempts)
            .map_err(|_| AppError::Db(format!("invalid attempts: {}", self.attempts)))?;

        Ok(QueueRecord {
            id: self.id,
            queue_id: self.queue_id,
            queue: self.queue,
            status,
            attempts,
            priority: self.priority,
            data: self.data,
            created_at: parse_ts(&self.created_at, "created_at")?,
            started_at: parse_opt_ts(self.started_at.as_deref(), "started_at")?,
            finished_at: parse_opt_ts(self.finished_at.as_deref(), "finished_at")?,
            next_eligible_at: parse_opt_ts(self.next_eligible_at.as_deref(), "next_eligible_at")?,
            last_error: self.last_error,
        })
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db_err| db_err.is_unique_violation())
}

impl RecordRepo {
    /// Create a new repository instance enforcing `max_attempts`.
    #[must_use]
    pub fn new(db: Arc<Database>, max_attempts: u32) -> Self {
        Self { db, max_attempts }
    }

    /// Retry ceiling applied by [`mark_failed`](Self::mark_failed).
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Insert a new `pending` record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::DuplicateQueueId` if a non-terminal record with the
    /// same `(queue, queue_id)` exists, or `AppError::Db` on storage failure.
    pub async fn enqueue(
        &self,
        queue: &str,
        queue_id: &str,
        priority: i64,
        data: &[u8],
    ) -> Result<QueueRecord> {
        let created_at = ts(Utc::now());
        let sql = format!(
            "INSERT INTO queue_record (queue_id, queue, status, attempts, priority, data, created_at)
             VALUES (?1, ?2, 'pending', 0, ?3, ?4, ?5)
             RETURNING {COLUMNS}"
        );

        let inserted = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(queue_id)
            .bind(queue)
            .bind(priority)
            .bind(data)
            .bind(&created_at)
            .fetch_one(self.db.as_ref())
            .await;

        match inserted {
            Ok(row) => {
                let record = row.into_record()?;
                debug!(record_id = record.id, queue, queue_id, priority, "record enqueued");
                Ok(record)
            }
            Err(err) if is_unique_violation(&err) => Err(AppError::DuplicateQueueId {
                queue: queue.to_owned(),
                queue_id: queue_id.to_owned(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Select up to `limit` ready records, highest priority then oldest first.
    ///
    /// Records still inside their retry backoff window are skipped.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn select_batch(&self, limit: u32) -> Result<Vec<QueueRecord>> {
        self.select_batch_excluding(limit, &[]).await
    }

    /// [`select_batch`](Self::select_batch) ignoring the given channels.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn select_batch_excluding(
        &self,
        limit: u32,
        excluded_queues: &[String],
    ) -> Result<Vec<QueueRecord>> {
        let now = ts(Utc::now());
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {COLUMNS} FROM queue_record
             WHERE status = 'pending'
               AND (next_eligible_at IS NULL OR next_eligible_at <= "
        ));
        query.push_bind(now);
        query.push(")");

        if !excluded_queues.is_empty() {
            query.push(" AND queue NOT IN (");
            let mut names = query.separated(", ");
            for name in excluded_queues {
                names.push_bind(name.as_str());
            }
            names.push_unseparated(")");
        }

        query.push(" ORDER BY priority DESC, created_at ASC, id ASC LIMIT ");
        query.push_bind(i64::from(limit));

        let rows: Vec<RecordRow> = query
            .build_query_as()
            .fetch_all(self.db.as_ref())
            .await?;
        rows.into_iter().map(RecordRow::into_record).collect()
    }

    /// Claim a `pending` record: `in_progress`, `attempts + 1`, `started_at = now`.
    ///
    /// Returns the freshly written record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotPending` if another worker already claimed it (or
    /// it is terminal), `AppError::NotFound` if it does not exist.
    pub async fn mark_in_progress(&self, id: i64) -> Result<QueueRecord> {
        let sql = format!(
            "UPDATE queue_record
             SET status = 'in_progress', attempts = attempts + 1,
                 started_at = ?1, next_eligible_at = NULL
             WHERE id = ?2 AND status = 'pending'
             RETURNING {COLUMNS}"
        );
        let mut conn = self.db.acquire().await?;
        let row: Option<RecordRow> = sqlx::query_as(&sql)
            .bind(ts(Utc::now()))
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;

        match row {
            Some(row) => row.into_record(),
            None => Err(transition_error(&mut conn, id, AppError::NotPending(id)).await),
        }
    }

    /// Record a successful attempt: `success` with `finished_at = now`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotInProgress` if the record is not `in_progress`,
    /// `AppError::NotFound` if it does not exist.
    pub async fn mark_success(&self, id: i64) -> Result<QueueRecord> {
        let mut conn = self.db.acquire().await?;
        self.mark_success_on(&mut conn, id).await
    }

    /// [`mark_success`](Self::mark_success) on a caller-held connection, so
    /// the transition can share a transaction with its audit row.
    ///
    /// # Errors
    ///
    /// As [`mark_success`](Self::mark_success).
    pub async fn mark_success_on(
        &self,
        conn: &mut SqliteConnection,
        id: i64,
    ) -> Result<QueueRecord> {
        let sql = format!(
            "UPDATE queue_record
             SET status = 'success', finished_at = ?1
             WHERE id = ?2 AND status = 'in_progress'
             RETURNING {COLUMNS}"
        );
        let row: Option<RecordRow> = sqlx::query_as(&sql)
            .bind(ts(Utc::now()))
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;

        match row {
            Some(row) => row.into_record(),
            None => Err(transition_error(conn, id, AppError::NotInProgress(id)).await),
        }
    }

    /// Record a failed attempt.
    ///
    /// `retry` carries the backoff when the failure is retryable. The record
    /// returns to `pending` (eligible after the backoff) only if `retry` is set
    /// and `attempts < max_attempts`; otherwise it becomes `dead` with
    /// `finished_at = now`. `last_error` is written either way. Backoffs
    /// longer than [`MAX_BACKOFF`] are shortened to it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotInProgress` if the record is not `in_progress`,
    /// `AppError::NotFound` if it does not exist.
    pub async fn mark_failed(
        &self,
        id: i64,
        error: &str,
        retry: Option<Duration>,
    ) -> Result<QueueRecord> {
        let mut conn = self.db.acquire().await?;
        self.mark_failed_on(&mut conn, id, error, retry).await
    }

    /// [`mark_failed`](Self::mark_failed) on a caller-held connection.
    ///
    /// # Errors
    ///
    /// As [`mark_failed`](Self::mark_failed).
    pub async fn mark_failed_on(
        &self,
        conn: &mut SqliteConnection,
        id: i64,
        error: &str,
        retry: Option<Duration>,
    ) -> Result<QueueRecord> {
        let now = Utc::now();
        let next_eligible_at = retry.map(|backoff| ts(eligible_after(now, backoff)));

        let sql = format!(
            "UPDATE queue_record
             SET status = CASE WHEN ?1 = 1 AND attempts < ?2 THEN 'pending' ELSE 'dead' END,
                 finished_at = CASE WHEN ?1 = 1 AND attempts < ?2 THEN NULL ELSE ?3 END,
                 next_eligible_at = CASE WHEN ?1 = 1 AND attempts < ?2 THEN ?4 ELSE NULL END,
                 last_error = ?5
             WHERE id = ?6 AND status = 'in_progress'
             RETURNING {COLUMNS}"
        );
        let row: Option<RecordRow> = sqlx::query_as(&sql)
            .bind(i64::from(retry.is_some()))
            .bind(i64::from(self.max_attempts))
            .bind(ts(now))
            .bind(next_eligible_at)
            .bind(error)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;

        let record = match row {
            Some(row) => row.into_record()?,
            None => return Err(transition_error(conn, id, AppError::NotInProgress(id)).await),
        };

        if record.status == RecordStatus::Dead && retry.is_some() {
            info!(
                record_id = id,
                attempts = record.attempts,
                max_attempts = self.max_attempts,
                "retries exhausted"
            );
        }
        Ok(record)
    }

    /// Fetch one record by id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if absent, `AppError::Db` on query failure.
    pub async fn get(&self, id: i64) -> Result<QueueRecord> {
        let mut conn = self.db.acquire().await?;
        fetch_record(&mut conn, id).await
    }

    /// List records matching `filter`, oldest id first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list(&self, filter: &RecordFilter) -> Result<Vec<QueueRecord>> {
        let mut query =
            QueryBuilder::<Sqlite>::new(format!("SELECT {COLUMNS} FROM queue_record WHERE 1 = 1"));
        if let Some(queue) = &filter.queue {
            query.push(" AND queue = ");
            query.push_bind(queue.as_str());
        }
        if let Some(status) = filter.status {
            query.push(" AND status = ");
            query.push_bind(status.as_str());
        }
        query.push(" ORDER BY id ASC");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ");
            query.push_bind(i64::from(limit));
        }

        let rows: Vec<RecordRow> = query
            .build_query_as()
            .fetch_all(self.db.as_ref())
            .await?;
        rows.into_iter().map(RecordRow::into_record).collect()
    }

    /// Count records per status, optionally for one channel.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn counts(&self, queue: Option<&str>) -> Result<QueueCounts> {
        let rows: Vec<(String, i64)> = if let Some(queue) = queue {
            sqlx::query_as(
                "SELECT status, COUNT(*) FROM queue_record WHERE queue = ?1 GROUP BY status",
            )
            .bind(queue)
            .fetch_all(self.db.as_ref())
            .await?
        } else {
            sqlx::query_as("SELECT status, COUNT(*) FROM queue_record GROUP BY status")
                .fetch_all(self.db.as_ref())
                .await?
        };

        let mut counts = QueueCounts::default();
        for (status, count) in rows {
            let status = RecordStatus::parse(&status)
                .ok_or_else(|| AppError::Db(format!("invalid record status: {status}")))?;
            let count = u64::try_from(count)
                .map_err(|_| AppError::Db(format!("invalid count: {count}")))?;
            counts.add(status, count);
        }
        Ok(counts)
    }
}

/// Moment a retried record becomes eligible again, at most [`MAX_BACKOFF`]
/// after `now`.
fn eligible_after(now: DateTime<Utc>, backoff: Duration) -> DateTime<Utc> {
    let backoff = chrono::Duration::from_std(backoff.min(MAX_BACKOFF))
        .unwrap_or_else(|_| chrono::Duration::days(1));
    now.checked_add_signed(backoff).unwrap_or(now)
}

async fn fetch_record(conn: &mut SqliteConnection, id: i64) -> Result<QueueRecord> {
    let sql = format!("SELECT {COLUMNS} FROM queue_record WHERE id = ?1");
    let row: Option<RecordRow> = sqlx::query_as(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    row.ok_or_else(|| AppError::NotFound(format!("queue record {id}")))?
        .into_record()
}

/// Resolve why a conditional transition matched no row.
async fn transition_error(
    conn: &mut SqliteConnection,
    id: i64,
    wrong_state: AppError,
) -> AppError {
    match fetch_record(conn, id).await {
        Ok(_) => wrong_state,
        Err(err) => err,
    }
}
