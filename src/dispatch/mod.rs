//! Channel dispatch: maps a queue name to the handler that executes its
//! payloads against the remote system.
//!
//! The table is filled once at startup and is read-only afterwards; the
//! drainer shares it behind an `Arc`.

pub mod http;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::{AppError, Result};

/// Failure reported by a handler for one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Connectivity failure or timeout; the record may be retried.
    Transport(String),
    /// The server refused the payload; retrying cannot help.
    Rejected(String),
}

impl HandlerError {
    /// Whether the failure class allows another attempt.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::Rejected(msg) => write!(f, "rejected: {msg}"),
        }
    }
}

impl std::error::Error for HandlerError {}

/// Boxed future returned by [`Handler::execute`].
pub type HandlerFuture<'a> =
    Pin<Box<dyn Future<Output = std::result::Result<(), HandlerError>> + Send + 'a>>;

/// Executes the payload of one queue channel against the remote system.
///
/// Implementations must not retry internally; the drainer owns the retry
/// budget and the per-call timeout.
pub trait Handler: Send + Sync {
    /// Perform the remote call for `data`.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Transport`] for retryable failures and
    /// [`HandlerError::Rejected`] when the server refused the payload.
    fn execute<'a>(&'a self, data: &'a [u8]) -> HandlerFuture<'a>;
}

/// Registration table from channel name to handler.
#[derive(Default, Clone)]
pub struct DispatchTable {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchTable")
            .field("queues", &self.queues())
            .finish()
    }
}

impl DispatchTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `queue`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the name is empty or already registered.
    pub fn register(&mut self, queue: impl Into<String>, handler: Arc<dyn Handler>) -> Result<()> {
        let queue = queue.into();
        if queue.trim().is_empty() {
            return Err(AppError::Config("queue name must not be empty".into()));
        }
        if self.handlers.contains_key(&queue) {
            return Err(AppError::Config(format!(
                "handler already registered for queue {queue}"
            )));
        }
        self.handlers.insert(queue, handler);
        Ok(())
    }

    /// Look up the handler for `queue`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::UnknownQueue` if nothing is registered under that name.
    pub fn resolve(&self, queue: &str) -> Result<Arc<dyn Handler>> {
        self.handlers
            .get(queue)
            .cloned()
            .ok_or_else(|| AppError::UnknownQueue(queue.to_owned()))
    }

    /// Registered channel names, sorted.
    #[must_use]
    pub fn queues(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}
