//! Retry policy: whether a failed attempt is retried, and after how long.

use std::time::Duration;

use rand::Rng;

use crate::config::DrainConfig;
use crate::dispatch::HandlerError;

/// Longest delay ever put between two attempts of one record.
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Retry policy for failed attempts.
///
/// Pure apart from the jitter drawn in [`backoff_delay`](Self::backoff_delay).
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts after which a record is given up on.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_backoff: Duration,
    /// Upper bound of the exponential delay.
    pub cap_backoff: Duration,
    /// Maximum extra random delay, as a fraction of the exponential delay.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        DrainConfig::default().retry_policy()
    }
}

impl RetryPolicy {
    /// Decide whether a record that has made `attempts` attempts and just
    /// failed with `error` should be tried again.
    ///
    /// Rejections never are: the server will answer the same way again.
    #[must_use]
    pub fn decide(&self, attempts: u32, error: &HandlerError) -> bool {
        match error {
            HandlerError::Transport(_) => attempts < self.max_attempts,
            HandlerError::Rejected(_) => false,
        }
    }

    /// Exponential delay without jitter: `min(base * 2^(attempts - 1), cap)`,
    /// never above [`MAX_BACKOFF`].
    ///
    /// `attempts` counts the attempt that just failed, so the first retry
    /// waits `base`.
    #[must_use]
    pub fn base_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        let cap = self.cap_backoff.min(MAX_BACKOFF);
        self.base_backoff
            .checked_mul(1_u32 << exponent)
            .map_or(cap, |delay| delay.min(cap))
    }

    /// [`base_delay`](Self::base_delay) plus up to `jitter_ratio` of it at
    /// random, so that clients reconnecting together spread their retries.
    #[must_use]
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let delay = self.base_delay(attempts);
        if delay.is_zero() || self.jitter_ratio <= 0.0 {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(0.0..=self.jitter_ratio.min(1.0));
        (delay + delay.mul_f64(factor)).min(MAX_BACKOFF)
    }
}
