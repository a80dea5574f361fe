//! `OfflineQueue`: the process-wide entry point wiring store, dispatch
//! table, connectivity gate and drainer together.
//!
//! Construct one per process with [`OfflineQueue::builder`] and share it
//! behind an `Arc` with producers and the UI layer.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info_span, Instrument};

use crate::dispatch::{DispatchTable, Handler};
use crate::drainer::connectivity::ConnectivityGate;
use crate::drainer::events::DrainEvent;
use crate::drainer::{DrainOptions, DrainReport, Drainer};
use crate::models::attempt::AttemptRecord;
use crate::models::record::{QueueCounts, QueueRecord, RecordFilter};
use crate::persistence::attempt_repo::AttemptRepo;
use crate::persistence::db::Database;
use crate::persistence::record_repo::RecordRepo;
use crate::persistence::recovery::{recover_orphans, RecoveryReport};
use crate::{AppError, Result};

/// Builder collecting handlers and options before the queue starts.
pub struct OfflineQueueBuilder {
    db: Arc<Database>,
    dispatch: DispatchTable,
    options: DrainOptions,
    online: bool,
    events: Option<mpsc::Sender<DrainEvent>>,
}

impl OfflineQueueBuilder {
    /// Override the drain options.
    #[must_use]
    pub fn options(mut self, options: DrainOptions) -> Self {
        self.options = options;
        self
    }

    /// Initial connectivity state.
    #[must_use]
    pub fn start_online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    /// Publish drain progress on `tx`.
    #[must_use]
    pub fn with_events(mut self, tx: mpsc::Sender<DrainEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Register the handler for one channel.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the channel already has a handler.
    pub fn register_handler(
        mut self,
        queue: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Result<Self> {
        self.dispatch.register(queue, handler)?;
        Ok(self)
    }

    /// Finish construction. Nothing runs until [`OfflineQueue::spawn`] or
    /// [`OfflineQueue::drain_now`] is called.
    #[must_use]
    pub fn build(self) -> OfflineQueue {
        let gate = Arc::new(ConnectivityGate::new(self.online));
        let mut drainer = Drainer::new(
            Arc::clone(&self.db),
            Arc::new(self.dispatch),
            self.options.clone(),
            gate.subscribe(),
        );
        if let Some(tx) = self.events {
            drainer = drainer.with_events(tx);
        }

        OfflineQueue {
            records: RecordRepo::new(Arc::clone(&self.db), self.options.policy.max_attempts),
            attempts: AttemptRepo::new(Arc::clone(&self.db)),
            db: self.db,
            gate,
            drainer: Arc::new(drainer),
        }
    }
}

/// Durable offline mutation queue.
pub struct OfflineQueue {
    db: Arc<Database>,
    records: RecordRepo,
    attempts: AttemptRepo,
    gate: Arc<ConnectivityGate>,
    drainer: Arc<Drainer>,
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("gate", &self.gate)
            .field("drainer", &self.drainer)
            .finish_non_exhaustive()
    }
}

impl OfflineQueue {
    /// Start building a queue over an already bootstrapped store.
    #[must_use]
    pub fn builder(db: Arc<Database>) -> OfflineQueueBuilder {
        OfflineQueueBuilder {
            db,
            dispatch: DispatchTable::new(),
            options: DrainOptions::default(),
            online: false,
            events: None,
        }
    }

    /// Capture one server-bound mutation.
    ///
    /// # Errors
    ///
    /// Returns `AppError::DuplicateQueueId` if the same logical operation is
    /// still queued, `AppError::Db` on storage failure.
    pub async fn enqueue(
        &self,
        queue: &str,
        queue_id: &str,
        priority: i64,
        data: &[u8],
    ) -> Result<QueueRecord> {
        self.records.enqueue(queue, queue_id, priority, data).await
    }

    /// [`enqueue`](Self::enqueue) a payload serialised as JSON.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `payload` cannot be serialised, otherwise
    /// as [`enqueue`](Self::enqueue).
    pub async fn enqueue_json<T: Serialize + ?Sized>(
        &self,
        queue: &str,
        queue_id: &str,
        priority: i64,
        payload: &T,
    ) -> Result<QueueRecord> {
        let data = serde_json::to_vec(payload)
            .map_err(|err| AppError::Config(format!("unserialisable payload: {err}")))?;
        self.enqueue(queue, queue_id, priority, &data).await
    }

    /// Report a connectivity change from the network-status collaborator.
    ///
    /// Returns `true` if the state flipped.
    pub fn on_connectivity_changed(&self, online: bool) -> bool {
        self.gate.set_online(online)
    }

    /// Whether the queue currently considers the server reachable.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.gate.is_online()
    }

    /// Shared connectivity gate, for wiring a probe.
    #[must_use]
    pub fn gate(&self) -> Arc<ConnectivityGate> {
        Arc::clone(&self.gate)
    }

    /// Audit read: records matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_records(&self, filter: &RecordFilter) -> Result<Vec<QueueRecord>> {
        self.records.list(filter).await
    }

    /// One record by id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if absent.
    pub async fn get(&self, id: i64) -> Result<QueueRecord> {
        self.records.get(id).await
    }

    /// Per-status counts, optionally for one channel.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn counts(&self, queue: Option<&str>) -> Result<QueueCounts> {
        self.records.counts(queue).await
    }

    /// Attempt history of one record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn attempts_for(&self, id: i64) -> Result<Vec<AttemptRecord>> {
        self.attempts.list_for_record(id).await
    }

    /// Reset records orphaned by a previous process.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the recovery transaction fails.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        recover_orphans(&self.db, self.records.max_attempts()).await
    }

    /// Run one drain cycle now, subject to the gate and single-flight lock.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the store fails.
    pub async fn drain_now(&self) -> Result<DrainReport> {
        self.drainer.drain_cycle().await
    }

    /// Recover orphans, then run the drain loop until `cancel` fires.
    #[must_use]
    pub fn spawn(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let db = Arc::clone(&self.db);
        let drainer = Arc::clone(&self.drainer);
        let max_attempts = self.records.max_attempts();

        tokio::spawn(
            async move {
                if let Err(err) = recover_orphans(&db, max_attempts).await {
                    error!(%err, "startup recovery failed; orphaned records stay in progress");
                }
                drainer.run(cancel).await;
            }
            .instrument(info_span!("offline_queue")),
        )
    }
}
