//! Progress notifications published by the drainer for the UI layer.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::models::record::{QueueCounts, RecordStatus};

use super::DrainReport;

/// Events emitted while draining, in the order they happen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DrainEvent {
    /// A drain cycle acquired the single-flight lock and is selecting work.
    CycleStarted,
    /// One record's attempt has been written back to the store.
    RecordFinished {
        /// Record id.
        id: i64,
        /// Channel name.
        queue: String,
        /// Status after the attempt (`success`, `pending` or `dead`).
        status: RecordStatus,
        /// Attempts made so far.
        attempts: u32,
    },
    /// A drain cycle ended.
    CycleFinished {
        /// What the cycle did.
        report: DrainReport,
        /// Per-status store counts after the cycle.
        counts: QueueCounts,
    },
}

/// Non-blocking publisher; a full or closed channel drops the event.
#[derive(Debug, Clone, Default)]
pub(crate) struct EventSink {
    tx: Option<mpsc::Sender<DrainEvent>>,
}

impl EventSink {
    pub(crate) fn new(tx: Option<mpsc::Sender<DrainEvent>>) -> Self {
        Self { tx }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    pub(crate) fn emit(&self, event: DrainEvent) {
        if let Some(tx) = &self.tx {
            if let Err(err) = tx.try_send(event) {
                debug!(%err, "drain event dropped");
            }
        }
    }
}
