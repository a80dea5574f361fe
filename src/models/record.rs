//! Queue record model, status state machine and read filters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a queued mutation.
///
/// `Pending ⇄ InProgress` cycles until the record becomes `Success` or
/// `Dead`. `Failed` is only ever read from rows written by older clients and
/// is normalised by startup recovery.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Waiting to be claimed by a drain cycle.
    Pending,
    /// Claimed; a remote call is (or was, before a crash) in flight.
    InProgress,
    /// Remote call succeeded.
    Success,
    /// Legacy retry-wait state.
    Failed,
    /// Retries exhausted or rejected by the server.
    Dead,
}

impl RecordStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::InProgress,
        Self::Success,
        Self::Failed,
        Self::Dead,
    ];

    /// Storage and wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }

    /// Terminal records never transition again and carry `finished_at`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Dead)
    }

    /// Determine whether a status transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress)
                | (Self::InProgress, Self::Success | Self::Pending | Self::Dead)
                | (Self::Failed, Self::Pending | Self::Dead)
        )
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("invalid record status: {s}"))
    }
}

/// A server-bound mutation captured while offline, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct QueueRecord {
    /// Store-assigned monotonic surrogate key.
    pub id: i64,
    /// Caller-assigned correlation key of the logical operation.
    pub queue_id: String,
    /// Channel name selecting the handler for `data`.
    pub queue: String,
    /// Current lifecycle status.
    pub status: RecordStatus,
    /// Execution attempts made so far.
    pub attempts: u32,
    /// Higher drains first.
    pub priority: i64,
    /// Opaque payload interpreted by the channel handler.
    pub data: Vec<u8>,
    /// Enqueue timestamp; immutable.
    pub created_at: DateTime<Utc>,
    /// Start of the most recent attempt.
    pub started_at: Option<DateTime<Utc>>,
    /// Set when the record reached `success` or `dead`.
    pub finished_at: Option<DateTime<Utc>>,
    /// Earliest time a retried record may be selected again.
    pub next_eligible_at: Option<DateTime<Utc>>,
    /// Most recent failure description, kept for audit.
    pub last_error: Option<String>,
}

impl QueueRecord {
    /// Payload as UTF-8 text, lossily decoded (diagnostics only).
    #[must_use]
    pub fn data_lossy(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Filter for the audit read API.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    /// Restrict to one channel.
    pub queue: Option<String>,
    /// Restrict to one status.
    pub status: Option<RecordStatus>,
    /// Maximum rows returned.
    pub limit: Option<u32>,
}

impl RecordFilter {
    /// Filter matching every record of `queue`.
    #[must_use]
    pub fn queue(queue: impl Into<String>) -> Self {
        Self {
            queue: Some(queue.into()),
            ..Self::default()
        }
    }

    /// Filter matching every record in `status`.
    #[must_use]
    pub fn status(status: RecordStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

/// Record counts per status, surfaced to the UI.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueCounts {
    /// Waiting records.
    pub pending: u64,
    /// Claimed records.
    pub in_progress: u64,
    /// Delivered records.
    pub success: u64,
    /// Legacy retry-wait records.
    pub failed: u64,
    /// Abandoned records.
    pub dead: u64,
}

impl QueueCounts {
    /// Records still waiting to be delivered.
    #[must_use]
    pub fn outstanding(&self) -> u64 {
        self.pending + self.in_progress + self.failed
    }

    pub(crate) fn add(&mut self, status: RecordStatus, count: u64) {
        match status {
            RecordStatus::Pending => self.pending += count,
            RecordStatus::InProgress => self.in_progress += count,
            RecordStatus::Success => self.success += count,
            RecordStatus::Failed => self.failed += count,
            RecordStatus::Dead => self.dead += count,
        }
    }
}
