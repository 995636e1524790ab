//! Per-chunk retry policy: exponential backoff with jitter and a minimum
//! delay per failure class.

use std::time::Duration;

use rand::Rng;

/// What kind of failure a retry is recovering from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Network,
    Server,
    RateLimited { retry_after: Option<Duration> },
    /// Not retryable.
    Fatal,
}

/// Retry budget and delay schedule for a single chunk.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts per chunk, including the first (at least 1).
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each further attempt.
    pub base_delay: Duration,
    /// Upper bound of the random delay added to every backoff.
    pub max_jitter: Duration,
    /// Minimum delay after a network error.
    pub network_floor: Duration,
    /// Minimum delay after a 5xx.
    pub server_floor: Duration,
    /// Minimum delay after a 429.
    pub rate_limit_floor: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_jitter: Duration::from_secs(1),
            network_floor: Duration::from_secs(3),
            server_floor: Duration::from_secs(2),
            rate_limit_floor: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `failed_attempts` failures.
    pub fn should_retry(&self, failed_attempts: u32, class: FailureClass) -> bool {
        class != FailureClass::Fatal && failed_attempts < self.max_attempts.max(1)
    }

    /// Delay before the next attempt after `failed_attempts` (1-based)
    /// consecutive failures, without jitter.
    ///
    /// `base * 2^(failed_attempts - 1)`, raised to the class floor. A
    /// server-provided `Retry-After` raises the rate-limit floor.
    pub fn base_delay_for(&self, failed_attempts: u32, class: FailureClass) -> Duration {
        let exp = failed_attempts.saturating_sub(1).min(16);
        let backoff = self.base_delay.saturating_mul(1u32 << exp);
        backoff.max(self.floor_for(class))
    }

    /// Delay before the next attempt with `jitter` added.
    pub fn delay_with_jitter(
        &self,
        failed_attempts: u32,
        class: FailureClass,
        jitter: Duration,
    ) -> Duration {
        self.base_delay_for(failed_attempts, class) + jitter.min(self.max_jitter)
    }

    /// Delay before the next attempt with a random jitter in
    /// `[0, max_jitter)`.
    pub fn delay_for(&self, failed_attempts: u32, class: FailureClass) -> Duration {
        let jitter = if self.max_jitter.is_zero() {
            Duration::ZERO
        } else {
            rand::thread_rng().gen_range(Duration::ZERO..self.max_jitter)
        };
        self.delay_with_jitter(failed_attempts, class, jitter)
    }

    fn floor_for(&self, class: FailureClass) -> Duration {
        match class {
            FailureClass::Network => self.network_floor,
            FailureClass::Server => self.server_floor,
            FailureClass::RateLimited { retry_after } => retry_after
                .unwrap_or_default()
                .max(self.rate_limit_floor),
            FailureClass::Fatal => Duration::ZERO,
        }
    }
}
