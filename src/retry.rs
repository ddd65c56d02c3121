//! Bounded retry with a fixed or growing delay between attempts.
//!
//! Every piece of flaky hardware I/O (camera open, sensor open, sensor
//! read) goes through [`RetryPolicy::run`], so exhaustion is an explicit
//! [`RetryError`] instead of an open-ended sleep loop.

use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// How many times to try an operation and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Must be at least 1.
    pub attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    pub delay_ms: u64,
    /// Multiplier applied to the delay after every failed attempt.
    #[serde(default = "default_backoff")]
    pub backoff: f64,
}

fn default_backoff() -> f64 {
    1.0
}

/// Returned when every attempt failed.
#[derive(Debug, Error)]
#[error("gave up after {attempts} attempt(s): {last}")]
pub struct RetryError<E: fmt::Display + fmt::Debug> {
    /// Number of attempts made.
    pub attempts: u32,
    /// Error from the final attempt.
    pub last: E,
}

impl RetryPolicy {
    /// Fixed delay between a bounded number of attempts.
    pub const fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts,
            delay_ms: delay.as_millis() as u64,
            backoff: 1.0,
        }
    }

    /// Delay waited after the given failed attempt (1-based). Saturates
    /// instead of overflowing.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.backoff.max(1.0).powi(attempt.saturating_sub(1) as i32);
        Duration::try_from_secs_f64(self.delay_ms as f64 / 1000.0 * factor).unwrap_or(Duration::MAX)
    }

    /// Whether the backoff multiplier is usable.
    pub fn has_valid_backoff(&self) -> bool {
        self.backoff.is_finite() && self.backoff >= 1.0
    }

    /// Runs `op` until it succeeds or the attempts are used up, sleeping the
    /// calling thread between attempts. No delay follows the last attempt.
    pub fn run<T, E, F>(&self, what: &str, op: F) -> Result<T, RetryError<E>>
    where
        E: fmt::Display + fmt::Debug,
        F: FnMut(u32) -> Result<T, E>,
    {
        self.run_with_sleep(
            what,
            |delay| {
                std::thread::sleep(delay);
                true
            },
            op,
        )
    }

    /// Like [`run`](Self::run), but waits on `stop` between attempts and
    /// gives up with the last error as soon as it fires or disconnects.
    pub fn run_until<T, E, F>(&self, what: &str, stop: &Receiver<()>, op: F) -> Result<T, RetryError<E>>
    where
        E: fmt::Display + fmt::Debug,
        F: FnMut(u32) -> Result<T, E>,
    {
        self.run_with_sleep(
            what,
            |delay| matches!(stop.recv_timeout(delay), Err(RecvTimeoutError::Timeout)),
            op,
        )
    }

    /// Same as [`run`](Self::run) with a caller-provided sleep. The sleep
    /// returns false to abandon the remaining attempts.
    pub fn run_with_sleep<T, E, F, S>(
        &self,
        what: &str,
        mut sleep: S,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        E: fmt::Display + fmt::Debug,
        F: FnMut(u32) -> Result<T, E>,
        S: FnMut(Duration) -> bool,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(what, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if attempt >= attempts => {
                    return Err(RetryError {
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    let delay = self.delay_after(attempt);
                    tracing::warn!(
                        what,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "attempt failed, retrying in {:?}",
                        delay
                    );
                    if !sleep(delay) {
                        tracing::debug!(what, attempt, "retry interrupted");
                        return Err(RetryError {
                            attempts: attempt,
                            last: e,
                        });
                    }
                    attempt += 1;
                }
            }
        }
    }
}
