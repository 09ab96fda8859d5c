//! Bounded exponential backoff for transient storage failures.
//!
//! `retry_with_backoff` runs an operation up to `RetryConfig::max_attempts`
//! times. Only errors selected by the caller's predicate are retried; any
//! other error is returned from the attempt that produced it. When attempts
//! run out the last error is returned unchanged.
//!
//! The default schedule is 3 attempts total with 0.5s and 1s pauses between
//! them (doubling, capped at 5s).

use std::fmt::Display;
use std::time::Duration;

/// Configuration for exponential backoff retry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,

    /// Delay before the second attempt.
    pub initial_delay: Duration,

    /// Cap for exponential growth.
    pub max_delay: Duration,

    /// Multiplier applied per attempt (typically 2.0).
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    pub const DEFAULT: Self = Self {
        max_attempts: 3,
        initial_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(5),
        backoff_multiplier: 2.0,
    };

    /// Run exactly once; transient failures surface immediately.
    pub const NO_RETRY: Self = Self {
        max_attempts: 1,
        initial_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        backoff_multiplier: 1.0,
    };

    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            backoff_multiplier,
        }
    }

    /// Same attempt budget, no sleeping. Used by tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO, 1.0)
    }

    /// Delay after the given failed attempt (0-indexed), capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = self.backoff_multiplier.powi(attempt as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped_secs.max(0.0))
    }

    /// All pauses a fully failing operation would go through.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_attempts.saturating_sub(1)).map(|attempt| self.delay_for_attempt(attempt))
    }

    pub fn total_max_wait(&self) -> Duration {
        self.delays().sum()
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Execute `operation` with retry on errors selected by `is_retriable`.
///
/// The operation receives the 1-based attempt number. A zero `max_attempts`
/// is treated as one attempt.
pub fn retry_with_backoff<T, E, F, P>(
    config: &RetryConfig,
    is_retriable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Result<T, E>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation(attempt) {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if is_retriable(&e) && attempt < max_attempts => {
                let delay = config.delay_for_attempt(attempt - 1);
                tracing::warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
            }
            Err(e) => {
                if is_retriable(&e) {
                    tracing::warn!(attempt, error = %e, "Retries exhausted");
                }
                return Err(e);
            }
        }
    }
}
