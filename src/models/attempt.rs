//! Per-attempt audit trail entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result of one execution attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Handler reported success.
    Succeeded,
    /// Connectivity or timeout failure; retryable.
    TransportError,
    /// Server rejected the payload; not retryable.
    Rejected,
    /// Process died mid-attempt; recorded by startup recovery.
    Abandoned,
}

impl AttemptOutcome {
    /// Storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::TransportError => "transport_error",
            Self::Rejected => "rejected",
            Self::Abandoned => "abandoned",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "succeeded" => Some(Self::Succeeded),
            "transport_error" => Some(Self::TransportError),
            "rejected" => Some(Self::Rejected),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }
}

/// One row of the append-only attempt log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttemptRecord {
    /// Store-assigned key.
    pub id: i64,
    /// Owning queue record.
    pub record_id: i64,
    /// 1-based attempt number, matching `QueueRecord::attempts` at the time.
    pub attempt: u32,
    /// When the attempt began.
    pub started_at: DateTime<Utc>,
    /// When the outcome was recorded.
    pub finished_at: DateTime<Utc>,
    /// Attempt result.
    pub outcome: AttemptOutcome,
    /// Failure description, if any.
    pub error: Option<String>,
}

/// Attempt data before persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAttempt {
    /// Owning queue record.
    pub record_id: i64,
    /// 1-based attempt number.
    pub attempt: u32,
    /// When the attempt began.
    pub started_at: DateTime<Utc>,
    /// When the outcome was recorded.
    pub finished_at: DateTime<Utc>,
    /// Attempt result.
    pub outcome: AttemptOutcome,
    /// Failure description, if any.
    pub error: Option<String>,
}
