//! Retry policy: bounded attempts with fixed backoff.

use std::time::Duration;

use crate::error::ErrorKind;

/// Retry policy for failed tasks.
///
/// Fixed backoff with an optional jitter window, bounded attempts. A
/// `Permanent` failure skips the remaining budget entirely: redelivering a
/// document-not-found can never succeed, it only delays the terminal FAILURE
/// the caller is waiting on.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before each retry.
    pub backoff: Duration,

    /// Maximum attempts per task (including the first).
    pub max_attempts: u32,

    /// Optional jitter window added on top of `backoff` to spread thundering
    /// herds of retries across the worker fleet.
    pub jitter: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(60),
            max_attempts: 3,
            jitter: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt.
    pub fn next_delay(&self) -> Duration {
        match self.jitter {
            None => self.backoff,
            Some(window) if window.is_zero() => self.backoff,
            Some(window) => {
                let extra = rand::random::<u64>() % window.as_millis().max(1) as u64;
                self.backoff + Duration::from_millis(extra)
            }
        }
    }

    /// Should a failure with `kind` after `attempts` tries be retried?
    pub fn should_retry(&self, attempts: u32, kind: ErrorKind) -> bool {
        kind == ErrorKind::Transient && attempts < self.max_attempts
    }
}
