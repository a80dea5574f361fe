//! Error types shared across the queue engine.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all queue failure modes.
///
/// Per-record handler failures are not represented here; see
/// [`HandlerError`](crate::dispatch::HandlerError).
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// HTTP client construction or probe failure.
    Http(String),
    /// Requested record does not exist.
    NotFound(String),
    /// An active record with the same `(queue, queue_id)` already exists.
    DuplicateQueueId {
        /// Channel name of the rejected enqueue.
        queue: String,
        /// Caller-assigned correlation key of the rejected enqueue.
        queue_id: String,
    },
    /// Record could not be claimed because it is no longer `pending`.
    NotPending(i64),
    /// Record outcome could not be written because it is not `in_progress`.
    NotInProgress(i64),
    /// No handler is registered for the channel name.
    UnknownQueue(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Http(msg) => write!(f, "http: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::DuplicateQueueId { queue, queue_id } => {
                write!(f, "duplicate queue id: {queue}/{queue_id}")
            }
            Self::NotPending(id) => write!(f, "not pending: record {id}"),
            Self::NotInProgress(id) => write!(f, "not in progress: record {id}"),
            Self::UnknownQueue(queue) => write!(f, "unknown queue: {queue}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}
