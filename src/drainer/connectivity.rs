//! Connectivity gate: the online/offline signal the drainer subscribes to.
//!
//! The gate is a `watch` channel of `bool`. The network-status collaborator
//! (or the built-in HTTP probe) writes it; the drain loop waits on it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

/// Shared online/offline flag.
#[derive(Debug)]
pub struct ConnectivityGate {
    tx: watch::Sender<bool>,
}

impl ConnectivityGate {
    /// Create a gate in the given initial state.
    #[must_use]
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    /// Report a connectivity change. Returns `true` if the state flipped.
    ///
    /// Repeated reports of the same state do not wake subscribers.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(online, "connectivity changed");
        }
        changed
    }

    /// Current state.
    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// New receiver observing future changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivityGate {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Spawn a background task probing `url` every `interval` and feeding the
/// result into `gate`.
///
/// Any `2xx` answer counts as online; errors, timeouts and other statuses
/// count as offline.
#[must_use]
pub fn spawn_probe(
    client: reqwest::Client,
    url: String,
    interval: Duration,
    gate: Arc<ConnectivityGate>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("connectivity probe shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let online = probe(&client, &url, interval).await;
                        gate.set_online(online);
                    }
                }
            }
        }
        .instrument(info_span!("connectivity_probe")),
    )
}

async fn probe(client: &reqwest::Client, url: &str, timeout: Duration) -> bool {
    match client.get(url).timeout(timeout).send().await {
        Ok(response) => {
            let online = response.status().is_success();
            debug!(status = response.status().as_u16(), online, "connectivity probe answered");
            online
        }
        Err(err) => {
            debug!(%err, "connectivity probe failed");
            false
        }
    }
}
