//! Exponential backoff, kept free of I/O so it can be tested on its own.

use std::time::Duration;

/// How many times to retry a failed connection attempt and how long to wait.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        backoff_delay(attempt, self.base_delay, self.multiplier)
    }
}

/// Delay after failed attempt `attempt`: `base * multiplier^attempt`.
///
/// Saturates at `Duration::MAX` instead of overflowing.
pub fn backoff_delay(attempt: u32, base: Duration, multiplier: f64) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let secs = base.as_secs_f64() * multiplier.powi(exponent);
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffState {
    /// Attempt `n` (1-based) is due.
    Attempting(u32),
    Succeeded,
    /// Retry budget spent or the failure was not worth retrying.
    Exhausted,
}

/// Tracks one connection sequence.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    state: BackoffState,
    last_attempt: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: BackoffState::Attempting(1),
            last_attempt: 1,
        }
    }

    pub fn state(&self) -> BackoffState {
        self.state
    }

    /// Attempts made or in progress.
    pub fn attempts(&self) -> u32 {
        self.last_attempt
    }

    pub fn succeed(&mut self) {
        if let BackoffState::Attempting(_) = self.state {
            self.state = BackoffState::Succeeded;
        }
    }

    /// Records that the current attempt failed.
    ///
    /// Returns how long to wait before the next attempt, or `None` once the
    /// retry budget is spent.
    pub fn fail(&mut self) -> Option<Duration> {
        let BackoffState::Attempting(n) = self.state else {
            return None;
        };
        if n > self.policy.max_retries {
            self.state = BackoffState::Exhausted;
            return None;
        }
        self.state = BackoffState::Attempting(n + 1);
        self.last_attempt = n + 1;
        Some(self.policy.delay_for(n))
    }

    /// Stops retrying regardless of the remaining budget.
    pub fn abort(&mut self) {
        self.state = BackoffState::Exhausted;
    }
}
