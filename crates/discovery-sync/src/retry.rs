//! # Retry Policy
//!
//! Each sender gets its own policy value and builds one backoff per
//! `send_all`, so the attempt counter carries across the sub-batches of a
//! call but never across calls or senders.
//!
//! ```text
//! attempt:  1    2    3    4    5  ...   9    10   11
//! delay:    1s   2s   4s   8s   16s ... 256s 256s 256s
//! ```

use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;

/// Exponential retry delays without jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(256),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        RetryPolicy { initial, max, multiplier }
    }

    /// A fresh backoff positioned at the first attempt.
    pub fn backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.initial,
            current_interval: self.initial,
            max_interval: self.max,
            multiplier: self.multiplier,
            randomization_factor: 0.0,
            max_elapsed_time: None,
            ..Default::default()
        };
        backoff.reset();
        backoff
    }

    /// The next delay, falling back to the ceiling.
    pub fn next_delay(backoff: &mut ExponentialBackoff) -> Duration {
        backoff.next_backoff().unwrap_or(backoff.max_interval)
    }
}
