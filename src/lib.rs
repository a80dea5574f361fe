#![forbid(unsafe_code)]

//! Durable offline mutation queue with a crash-safe drain engine.
//!
//! Producers capture server-bound operations with
//! [`OfflineQueue::enqueue`](service::OfflineQueue::enqueue) while offline;
//! the drainer replays them through per-channel handlers once the
//! connectivity gate reports online, with bounded retries and an audit trail
//! of every attempt.

pub mod config;
pub mod dispatch;
pub mod drainer;
pub mod errors;
pub mod models;
pub mod persistence;
pub mod retry;
pub mod service;

pub use config::QueueConfig;
pub use errors::{AppError, Result};
pub use service::{OfflineQueue, OfflineQueueBuilder};
