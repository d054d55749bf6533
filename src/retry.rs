//! Reconnect backoff policy.
//!
//! The policy is transport-agnostic: it only answers "how long to wait before
//! retry N" and "is retry N still allowed". Scheduling the wait is the
//! caller's job.

use std::time::Duration;

use rand::Rng;

/// Default delay between a lost connection and the next attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(3000);
/// Default ceiling on consecutive reconnect attempts.
pub const DEFAULT_MAX_ATTEMPTS: usize = 5;

/// Policy controlling reconnect attempts and backoff behavior.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Maximum number of consecutive retries after a lost connection.
    ///
    /// The counter resets whenever a connection opens successfully.
    pub max_attempts: usize,
    /// Delay used before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    ///
    /// Equal to `initial_backoff` for a fixed delay.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each retry delay.
    pub jitter: Duration,
}

impl ReconnectPolicy {
    /// Fixed delay between every attempt, no jitter.
    pub fn fixed(delay: Duration, max_attempts: usize) -> Self {
        Self {
            max_attempts,
            initial_backoff: delay,
            max_backoff: delay,
            jitter: Duration::ZERO,
        }
    }

    /// Doubling delay starting at `initial_backoff`, capped at `max_backoff`.
    pub fn exponential(
        initial_backoff: Duration,
        max_backoff: Duration,
        max_attempts: usize,
    ) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
            jitter: Duration::ZERO,
        }
    }

    /// Adds up to `jitter` of random delay to every retry.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether retry number `attempt` (1-based) is within the ceiling.
    pub fn allows(&self, attempt: usize) -> bool {
        (1..=self.max_attempts).contains(&attempt)
    }

    /// Delay before retry number `attempt` (1-based): `initial_backoff`
    /// doubled once per earlier retry, capped at `max_backoff`, plus jitter.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31) as u32;
        let base = self
            .initial_backoff
            .checked_mul(1 << doublings)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff));
        base + random_jitter(self.jitter)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_RECONNECT_DELAY, DEFAULT_MAX_ATTEMPTS)
    }
}

/// Random duration in `0..=max`.
fn random_jitter(max: Duration) -> Duration {
    let max_nanos = u64::try_from(max.as_nanos()).unwrap_or(u64::MAX);
    if max_nanos == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rand::rng().random_range(0..=max_nanos))
}
