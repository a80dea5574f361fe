//! Startup recovery of records orphaned by a previous process.
//!
//! A record left `in_progress` means the process died mid-attempt. Before
//! the first drain cycle such records are returned to `pending` (or made
//! `dead` once the attempt ceiling is reached) and the lost attempt is
//! written to the audit log as `abandoned`. Legacy `failed` rows are
//! normalised the same way, without an audit row.
//!
//! Tooling that may run beside a live drainer uses
//! [`recover_stale_orphans`], which leaves recently claimed records alone.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::models::attempt::AttemptOutcome;
use crate::models::record::RecordStatus;
use crate::{AppError, Result};

use super::attempt_repo::INSERT_ATTEMPT;
use super::db::Database;
use super::record_repo::{RecordRow, COLUMNS};
use super::ts;

/// Error text recorded for attempts cut short by a process exit.
pub const ORPHANED_ERROR: &str = "orphaned in progress: process exited mid-attempt";

/// Summary of one recovery pass.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Records returned to `pending`.
    pub requeued: u64,
    /// Records that had no attempts left and became `dead`.
    pub dead: u64,
}

/// Reset orphaned records in a single transaction.
///
/// # Errors
///
/// Returns `AppError::Db` if any statement fails; nothing is changed then.
pub async fn recover_orphans(db: &Database, max_attempts: u32) -> Result<RecoveryReport> {
    recover(db, max_attempts, None)
        .instrument(info_span!("startup_recovery"))
        .await
}

/// Like [`recover_orphans`], but only resets `in_progress` records claimed
/// at least `stale_after` ago.
///
/// A drainer bounds every call by its timeout, so a claim older than that
/// is no longer in flight and is safe to reset while the drainer runs.
///
/// # Errors
///
/// Returns `AppError::Config` if `stale_after` is out of range,
/// `AppError::Db` if any statement fails.
pub async fn recover_stale_orphans(
    db: &Database,
    max_attempts: u32,
    stale_after: Duration,
) -> Result<RecoveryReport> {
    let age = chrono::Duration::from_std(stale_after)
        .map_err(|err| AppError::Config(format!("stale_after out of range: {err}")))?;
    let cutoff = Utc::now()
        .checked_sub_signed(age)
        .ok_or_else(|| AppError::Config("stale_after out of range".into()))?;

    recover(db, max_attempts, Some(cutoff))
        .instrument(info_span!("stale_recovery", stale_after_secs = stale_after.as_secs()))
        .await
}

async fn recover(
    db: &Database,
    max_attempts: u32,
    claimed_before: Option<DateTime<Utc>>,
) -> Result<RecoveryReport> {
    let now = ts(Utc::now());
    let mut tx = db.begin().await?;

    let sql = format!(
        "SELECT {COLUMNS} FROM queue_record
         WHERE status = 'failed'
            OR (status = 'in_progress'
                AND (?1 IS NULL OR started_at IS NULL OR started_at <= ?1))
         ORDER BY id ASC"
    );
    let rows: Vec<RecordRow> = sqlx::query_as(&sql)
        .bind(claimed_before.map(ts))
        .fetch_all(&mut *tx)
        .await?;

    let mut report = RecoveryReport::default();
    for row in rows {
        let record = row.into_record()?;
        let orphaned = record.status == RecordStatus::InProgress;
        let target = if record.attempts >= max_attempts {
            RecordStatus::Dead
        } else {
            RecordStatus::Pending
        };
        if !record.status.can_transition_to(target) {
            return Err(AppError::Db(format!(
                "invalid record status transition: {} -> {target}",
                record.status
            )));
        }

        if orphaned {
            let started_at = record.started_at.unwrap_or(record.created_at);
            sqlx::query(INSERT_ATTEMPT)
                .bind(record.id)
                .bind(i64::from(record.attempts))
                .bind(ts(started_at))
                .bind(&now)
                .bind(AttemptOutcome::Abandoned.as_str())
                .bind(ORPHANED_ERROR)
                .execute(&mut *tx)
                .await?;
        }

        let last_error = if orphaned {
            Some(ORPHANED_ERROR.to_owned())
        } else {
            record.last_error.clone()
        };

        if target == RecordStatus::Dead {
            sqlx::query(
                "UPDATE queue_record
                 SET status = 'dead', finished_at = ?1, next_eligible_at = NULL, last_error = ?2
                 WHERE id = ?3",
            )
            .bind(&now)
            .bind(&last_error)
            .bind(record.id)
            .execute(&mut *tx)
            .await?;
            warn!(
                record_id = record.id,
                queue = %record.queue,
                attempts = record.attempts,
                "orphaned record has no attempts left; marked dead"
            );
            report.dead += 1;
        } else {
            sqlx::query(
                "UPDATE queue_record
                 SET status = 'pending', finished_at = NULL, next_eligible_at = NULL, last_error = ?1
                 WHERE id = ?2",
            )
            .bind(&last_error)
            .bind(record.id)
            .execute(&mut *tx)
            .await?;
            report.requeued += 1;
        }
    }

    tx.commit().await?;

    if report.requeued > 0 || report.dead > 0 {
        info!(
            requeued = report.requeued,
            dead = report.dead,
            "recovered orphaned queue records"
        );
    } else {
        info!("no orphaned queue records found");
    }
    Ok(report)
}
