use std::time::Duration;
use tracing::warn;

/// Base delay for the first rate-limit retry.
const INITIAL_DELAY_SECS: u64 = 1;
/// Upper bound on a single backoff wait.
const MAX_DELAY_SECS: u64 = 600;

/// Decision returned by the retry policy after evaluating a push response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// The push was accepted.
    Proceed,
    /// Rate limited: wait `delay`, then retry (1-based retry number).
    Retry { attempt: u32, delay: Duration },
    /// Non-retryable status, or rate-limit retries exhausted.
    Fail,
}

/// Retry policy for a single batch push.
///
/// Only HTTP 429 is retried, waiting `2^attempt` seconds before each retry.
/// `max_attempts` bounds the total number of requests for one batch, so a
/// batch that is rate limited on every request is tried `max_attempts` times
/// and waits `max_attempts - 1` times.
pub struct RetryPolicy {
    max_attempts: u32,
    current_attempt: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            current_attempt: 0,
        }
    }

    /// Evaluate the HTTP status of the latest request and decide what to do.
    pub fn evaluate(&mut self, status: u16) -> RetryDecision {
        if (200..300).contains(&status) {
            return RetryDecision::Proceed;
        }

        if status != 429 {
            return RetryDecision::Fail;
        }

        if self.current_attempt + 1 < self.max_attempts {
            let delay = backoff_delay(INITIAL_DELAY_SECS, self.current_attempt, MAX_DELAY_SECS);
            self.current_attempt += 1;
            warn!(
                attempt = self.current_attempt,
                max_attempts = self.max_attempts,
                wait_secs = delay,
                "push rate limited, retrying"
            );
            RetryDecision::Retry {
                attempt: self.current_attempt,
                delay: Duration::from_secs(delay),
            }
        } else {
            warn!(
                max_attempts = self.max_attempts,
                "push rate limit retries exhausted"
            );
            RetryDecision::Fail
        }
    }

    /// Reset the retry counter for a new batch.
    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    /// Current attempt count (0 = no retries yet).
    #[allow(dead_code)]
    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }
}

/// Calculate exponential backoff delay.
///
/// Returns `initial_delay * 2^consecutive_count`, capped at `max_delay`.
pub fn backoff_delay(initial_delay_secs: u64, consecutive_count: u32, max_delay_secs: u64) -> u64 {
    let shift = 1u64.checked_shl(consecutive_count).unwrap_or(u64::MAX);
    let delay = initial_delay_secs.saturating_mul(shift);
    delay.min(max_delay_secs)
}
