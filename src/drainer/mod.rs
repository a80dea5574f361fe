//! Drain engine: replays queued records against their channel handlers.
//!
//! A drain cycle selects a bounded batch of ready records (highest priority,
//! then oldest), executes them strictly one after another and writes each
//! outcome back to the store before starting the next. At most one cycle
//! runs per [`Drainer`] at any time; a second caller returns immediately.

pub mod connectivity;
pub mod events;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::DrainConfig;
use crate::dispatch::{DispatchTable, Handler, HandlerError};
use crate::models::attempt::{AttemptOutcome, NewAttempt};
use crate::models::record::{QueueRecord, RecordStatus};
use crate::persistence::attempt_repo::AttemptRepo;
use crate::persistence::db::Database;
use crate::persistence::record_repo::RecordRepo;
use crate::retry::RetryPolicy;
use crate::{AppError, Result};

use self::events::{DrainEvent, EventSink};

/// Tuning knobs of one drainer.
#[derive(Debug, Clone, PartialEq)]
pub struct DrainOptions {
    /// Records selected per batch.
    pub batch_size: u32,
    /// Bound on a single handler call; expiry counts as a transport error.
    pub call_timeout: Duration,
    /// Idle wait between cycles while online.
    pub poll_interval: Duration,
    /// Retry decision and backoff.
    pub policy: RetryPolicy,
}

impl Default for DrainOptions {
    fn default() -> Self {
        Self::from(&DrainConfig::default())
    }
}

impl From<&DrainConfig> for DrainOptions {
    fn from(config: &DrainConfig) -> Self {
        Self {
            batch_size: config.batch_size,
            call_timeout: config.call_timeout(),
            poll_interval: config.poll_interval(),
            policy: config.retry_policy(),
        }
    }
}

/// Summary of one [`Drainer::drain_cycle`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Another cycle held the single-flight lock; nothing was done.
    pub skipped: bool,
    /// Batches selected during the cycle.
    pub batches: u32,
    /// Records returned by the batch selections.
    pub selected: u32,
    /// Records this cycle moved to `in_progress`.
    pub claimed: u32,
    /// Records that reached `success`.
    pub succeeded: u32,
    /// Records sent back to `pending` for a later retry.
    pub retried: u32,
    /// Records that reached `dead`.
    pub dead: u32,
    /// Records another worker claimed first.
    pub not_claimed: u32,
    /// Claimed records reset by a concurrent recovery before their outcome
    /// was written; the outcome was discarded.
    pub claims_lost: u32,
    /// Records left untouched because no handler serves their channel.
    pub unknown_queue: u32,
    /// The gate went (or was) offline; remaining records were not started.
    pub interrupted: bool,
}

impl DrainReport {
    fn absorb(&mut self, batch: &Self) {
        self.batches += batch.batches;
        self.selected += batch.selected;
        self.claimed += batch.claimed;
        self.succeeded += batch.succeeded;
        self.retried += batch.retried;
        self.dead += batch.dead;
        self.not_claimed += batch.not_claimed;
        self.claims_lost += batch.claims_lost;
        self.unknown_queue += batch.unknown_queue;
        self.interrupted |= batch.interrupted;
    }
}

/// Single-flight drain engine over one store.
pub struct Drainer {
    db: Arc<Database>,
    records: RecordRepo,
    attempts: AttemptRepo,
    dispatch: Arc<DispatchTable>,
    options: DrainOptions,
    gate: watch::Receiver<bool>,
    events: EventSink,
    flight: Mutex<()>,
    halted: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for Drainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drainer")
            .field("dispatch", &self.dispatch)
            .field("options", &self.options)
            .field("online", &*self.gate.borrow())
            .finish_non_exhaustive()
    }
}

impl Drainer {
    /// Create a drainer over `db`, gated by `gate`.
    #[must_use]
    pub fn new(
        db: Arc<Database>,
        dispatch: Arc<DispatchTable>,
        options: DrainOptions,
        gate: watch::Receiver<bool>,
    ) -> Self {
        Self {
            records: RecordRepo::new(Arc::clone(&db), options.policy.max_attempts),
            attempts: AttemptRepo::new(Arc::clone(&db)),
            db,
            dispatch,
            options,
            gate,
            events: EventSink::default(),
            flight: Mutex::new(()),
            halted: Mutex::new(HashSet::new()),
        }
    }

    /// Publish progress events on `tx`.
    #[must_use]
    pub fn with_events(mut self, tx: mpsc::Sender<DrainEvent>) -> Self {
        self.events = EventSink::new(Some(tx));
        self
    }

    /// Current drain options.
    #[must_use]
    pub fn options(&self) -> &DrainOptions {
        &self.options
    }

    /// Whether the connectivity gate currently reports online.
    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.gate.borrow()
    }

    /// Channels whose draining was halted because no handler is registered.
    pub async fn halted_queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self.halted.lock().await.iter().cloned().collect();
        names.sort();
        names
    }

    /// Run one drain cycle.
    ///
    /// Returns immediately with `skipped` set if another cycle is in flight.
    /// Keeps selecting batches while they come back full and make progress.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the store fails; records already processed
    /// keep their written state.
    pub async fn drain_cycle(&self) -> Result<DrainReport> {
        let Ok(_flight) = self.flight.try_lock() else {
            debug!("drain cycle already in flight");
            return Ok(DrainReport {
                skipped: true,
                ..DrainReport::default()
            });
        };

        self.cycle().instrument(info_span!("drain_cycle")).await
    }

    /// Run the drain loop until `cancel` fires.
    ///
    /// Waits while offline, drains on every transition to online and then
    /// every `poll_interval` so that records whose backoff elapsed are
    /// picked up.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut gate = self.gate.clone();
        info!(
            batch_size = self.options.batch_size,
            poll_interval_secs = self.options.poll_interval.as_secs(),
            "drainer started"
        );

        loop {
            loop {
                let online = *gate.borrow_and_update();
                if online {
                    break;
                }
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("drainer shutting down");
                        return;
                    }
                    changed = gate.changed() => {
                        if changed.is_err() {
                            info!("connectivity gate closed; drainer stopping");
                            return;
                        }
                    }
                }
            }

            if let Err(err) = self.drain_cycle().await {
                error!(%err, "drain cycle failed");
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    info!("drainer shutting down");
                    return;
                }
                () = tokio::time::sleep(self.options.poll_interval) => {}
                changed = gate.changed() => {
                    if changed.is_err() {
                        info!("connectivity gate closed; drainer stopping");
                        return;
                    }
                }
            }
        }
    }

    async fn cycle(&self) -> Result<DrainReport> {
        self.events.emit(DrainEvent::CycleStarted);
        let mut report = DrainReport::default();
        loop {
            let batch = self.drain_batch().await?;
            report.absorb(&batch);

            let full = batch.selected >= self.options.batch_size;
            let progressed = batch.claimed > 0 || batch.unknown_queue > 0;
            if batch.interrupted || !full || !progressed {
                break;
            }
        }

        if report.selected > 0 {
            info!(
                batches = report.batches,
                claimed = report.claimed,
                succeeded = report.succeeded,
                retried = report.retried,
                dead = report.dead,
                interrupted = report.interrupted,
                "drain cycle finished"
            );
        }

        if self.events.is_enabled() {
            let counts = self.records.counts(None).await?;
            self.events.emit(DrainEvent::CycleFinished {
                report: report.clone(),
                counts,
            });
        }
        Ok(report)
    }

    async fn drain_batch(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        if !self.is_online() {
            report.interrupted = true;
            return Ok(report);
        }

        let excluded = self.halted_queues().await;
        let batch = self
            .records
            .select_batch_excluding(self.options.batch_size, &excluded)
            .await?;
        report.batches = 1;
        report.selected = u32::try_from(batch.len()).unwrap_or(u32::MAX);

        for record in batch {
            if !self.is_online() {
                info!(record_id = record.id, "went offline mid-batch; stopping");
                report.interrupted = true;
                break;
            }

            let handler = match self.dispatch.resolve(&record.queue) {
                Ok(handler) => handler,
                Err(err) => {
                    self.halt(&record.queue, &err).await;
                    report.unknown_queue += 1;
                    continue;
                }
            };

            let claimed = match self.records.mark_in_progress(record.id).await {
                Ok(claimed) => claimed,
                Err(AppError::NotPending(id)) => {
                    debug!(record_id = id, "record already claimed; skipping");
                    report.not_claimed += 1;
                    continue;
                }
                Err(err) => return Err(err),
            };
            report.claimed += 1;

            let updated = match self.attempt(&claimed, handler.as_ref()).await {
                Ok(updated) => updated,
                Err(AppError::NotInProgress(id)) => {
                    warn!(record_id = id, "record was reset while in flight; outcome discarded");
                    report.claims_lost += 1;
                    continue;
                }
                Err(err) => return Err(err),
            };
            match updated.status {
                RecordStatus::Success => report.succeeded += 1,
                RecordStatus::Pending => report.retried += 1,
                RecordStatus::Dead => report.dead += 1,
                RecordStatus::InProgress | RecordStatus::Failed => {}
            }
            self.events.emit(DrainEvent::RecordFinished {
                id: updated.id,
                queue: updated.queue.clone(),
                status: updated.status,
                attempts: updated.attempts,
            });
        }

        Ok(report)
    }

    /// Execute one claimed record and persist the outcome plus its audit row
    /// in a single transaction.
    ///
    /// Returns `AppError::NotInProgress` if the claim was reset meanwhile;
    /// nothing is written then.
    async fn attempt(&self, claimed: &QueueRecord, handler: &dyn Handler) -> Result<QueueRecord> {
        let started_at = claimed.started_at.unwrap_or_else(Utc::now);
        let call = tokio::time::timeout(self.options.call_timeout, handler.execute(&claimed.data));
        let result = match call.await {
            Ok(result) => result,
            Err(_) => Err(HandlerError::Transport(format!(
                "call timed out after {}ms",
                self.options.call_timeout.as_millis()
            ))),
        };

        let policy = &self.options.policy;
        let retry = match &result {
            Ok(()) => None,
            Err(err) => policy
                .decide(claimed.attempts, err)
                .then(|| policy.backoff_delay(claimed.attempts)),
        };

        // The transition and its audit row commit together or not at all.
        let mut tx = self.db.begin().await?;
        let (updated, outcome, error) = match &result {
            Ok(()) => {
                let updated = self.records.mark_success_on(&mut tx, claimed.id).await?;
                (updated, AttemptOutcome::Succeeded, None)
            }
            Err(err) => {
                let message = err.to_string();
                let updated = self
                    .records
                    .mark_failed_on(&mut tx, claimed.id, &message, retry)
                    .await?;
                let outcome = if err.is_transport() {
                    AttemptOutcome::TransportError
                } else {
                    AttemptOutcome::Rejected
                };
                (updated, outcome, Some(message))
            }
        };
        self.attempts
            .insert_on(
                &mut tx,
                &NewAttempt {
                    record_id: claimed.id,
                    attempt: claimed.attempts,
                    started_at,
                    finished_at: updated.finished_at.unwrap_or_else(Utc::now),
                    outcome,
                    error,
                },
            )
            .await?;
        tx.commit().await?;

        match &result {
            Ok(()) => debug!(record_id = claimed.id, queue = %claimed.queue, "record delivered"),
            Err(err) => warn!(
                record_id = claimed.id,
                queue = %claimed.queue,
                attempts = claimed.attempts,
                error = %err,
                status = %updated.status,
                backoff_ms = retry.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
                "record attempt failed"
            ),
        }

        Ok(updated)
    }

    async fn halt(&self, queue: &str, err: &AppError) {
        if self.halted.lock().await.insert(queue.to_owned()) {
            error!(
                queue,
                %err,
                "no handler registered for queue; halting its records"
            );
        }
    }
}
