//! Bounded exponential backoff with injectable jitter.
//!
//! Every retry loop in lakelog has a terminal failure: either a maximum
//! number of attempts or an overall timeout. The delay before attempt `n`
//! (1-based, counting retries) is a pure function of the policy and a jitter
//! sample in `[0, 1)`:
//!
//! ```text
//! base  = min(max_wait, first_wait * 2^(n - 1))
//! delay = base * (0.5 + 0.5 * jitter)
//! ```
//!
//! Tests inject a fixed jitter via [`RetryPolicy::with_jitter`] so waits are
//! deterministic.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Source of jitter samples in `[0, 1)`.
pub type JitterFn = Arc<dyn Fn() -> f64 + Send + Sync>;

/// When a retry loop gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryLimit {
    /// Give up after this many attempts in total (first try included).
    Attempts(u32),
    /// Give up once this much time has passed since the first attempt.
    Timeout(Duration),
}

/// Exponential backoff policy.
#[derive(Clone)]
pub struct RetryPolicy {
    first_wait: Duration,
    max_wait: Duration,
    limit: RetryLimit,
    jitter: JitterFn,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("first_wait", &self.first_wait)
            .field("max_wait", &self.max_wait)
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    /// Creates a policy bounded by a number of attempts.
    #[must_use]
    pub fn with_max_attempts(first_wait: Duration, max_wait: Duration, attempts: u32) -> Self {
        Self {
            first_wait,
            max_wait,
            limit: RetryLimit::Attempts(attempts.max(1)),
            jitter: Arc::new(random_jitter),
        }
    }

    /// Creates a policy bounded by total elapsed time.
    #[must_use]
    pub fn with_timeout(first_wait: Duration, max_wait: Duration, timeout: Duration) -> Self {
        Self {
            first_wait,
            max_wait,
            limit: RetryLimit::Timeout(timeout),
            jitter: Arc::new(random_jitter),
        }
    }

    /// Replaces the jitter source.
    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterFn) -> Self {
        self.jitter = jitter;
        self
    }

    /// Uses a constant jitter sample, for deterministic tests.
    #[must_use]
    pub fn with_fixed_jitter(self, sample: f64) -> Self {
        self.with_jitter(fixed_jitter(sample))
    }

    /// Returns the wait before the first retry.
    #[must_use]
    pub const fn first_wait(&self) -> Duration {
        self.first_wait
    }

    /// Returns the cap on any single wait.
    #[must_use]
    pub const fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Returns the terminal condition.
    #[must_use]
    pub const fn limit(&self) -> RetryLimit {
        self.limit
    }

    /// Computes the wait before retry number `retry` (1-based).
    #[must_use]
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        delay_for_retry(self.first_wait, self.max_wait, retry, (self.jitter)())
    }

    /// Starts tracking a retry loop.
    #[must_use]
    pub fn start(&self) -> RetryState<'_> {
        RetryState {
            policy: self,
            attempts: 0,
            next_delay: Duration::ZERO,
            started: Instant::now(),
        }
    }
}

/// Pure backoff computation.
///
/// `jitter` is clamped to `[0, 1]`; a `retry` of zero is treated as one.
#[must_use]
pub fn delay_for_retry(first_wait: Duration, max_wait: Duration, retry: u32, jitter: f64) -> Duration {
    let exponent = retry.saturating_sub(1).min(31);
    let base = first_wait
        .saturating_mul(1_u32 << exponent)
        .min(max_wait);
    base.mul_f64(0.5 + 0.5 * jitter.clamp(0.0, 1.0))
}

/// Returns a jitter source that always yields `sample`.
#[must_use]
pub fn fixed_jitter(sample: f64) -> JitterFn {
    Arc::new(move || sample)
}

fn random_jitter() -> f64 {
    rand::rng().random::<f64>()
}

/// Progress of one retry loop under a [`RetryPolicy`].
#[derive(Debug)]
pub struct RetryState<'a> {
    policy: &'a RetryPolicy,
    attempts: u32,
    /// Sampled once per attempt; both the timeout check and the sleep use it.
    next_delay: Duration,
    started: Instant,
}

impl RetryState<'_> {
    /// Records an attempt and returns its 1-based number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.next_delay = self.policy.delay_for_retry(self.attempts);
        self.attempts
    }

    /// Returns the number of attempts made so far.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns true if another attempt is allowed.
    #[must_use]
    pub fn can_retry(&self) -> bool {
        match self.policy.limit {
            RetryLimit::Attempts(max) => self.attempts < max,
            RetryLimit::Timeout(timeout) => self.started.elapsed() + self.next_delay <= timeout,
        }
    }

    /// Sleeps for the backoff delay that follows the current attempt.
    ///
    /// Returns the delay slept.
    pub async fn backoff(&self) -> Duration {
        tokio::time::sleep(self.next_delay).await;
        self.next_delay
    }
}
