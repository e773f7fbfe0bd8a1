//! Retry with exponential backoff and jitter.
//!
//! [`with_retry`] is shared by every caller that talks to an unreliable remote:
//! the facilitator client uses it with [`crate::facilitator::FacilitatorError::is_transport`]
//! as the predicate, signing backends can use it with their own.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::config::duration_millis;
use crate::util::CallContext;

/// Backoff parameters for [`with_retry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one. `0` behaves as `1`.
    #[serde(default = "RetryPolicy::default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(default = "RetryPolicy::default_initial_delay", with = "duration_millis")]
    pub initial_delay: Duration,
    /// Upper bound for a single delay.
    #[serde(default = "RetryPolicy::default_max_delay", with = "duration_millis")]
    pub max_delay: Duration,
    /// Growth factor applied per retry.
    #[serde(default = "RetryPolicy::default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            initial_delay: Self::default_initial_delay(),
            max_delay: Self::default_max_delay(),
            multiplier: Self::default_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// No retries: a single attempt.
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 1;
    pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(100);
    /// Four times the initial delay.
    pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(400);
    pub const DEFAULT_MULTIPLIER: f64 = 2.0;

    fn default_max_attempts() -> u32 {
        Self::DEFAULT_MAX_ATTEMPTS
    }

    fn default_initial_delay() -> Duration {
        Self::DEFAULT_INITIAL_DELAY
    }

    fn default_max_delay() -> Duration {
        Self::DEFAULT_MAX_DELAY
    }

    fn default_multiplier() -> f64 {
        Self::DEFAULT_MULTIPLIER
    }

    /// A policy making `max_attempts` attempts with the default delays.
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Un-jittered delay before retry number `attempt` (0-indexed):
    /// `min(initial_delay * multiplier^attempt, max_delay)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        match Duration::try_from_secs_f64(secs) {
            Ok(delay) => delay.min(self.max_delay),
            Err(_) => self.max_delay,
        }
    }

    /// Jittered delay before retry number `attempt`: uniformly in `[backoff / 2, backoff]`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let backoff = self.backoff(attempt);
        let half = u64::try_from(backoff.as_nanos() / 2).unwrap_or(u64::MAX / 2);
        let jitter = rand::rng().random_range(0..=half);
        Duration::from_nanos(half.saturating_add(jitter))
    }
}

/// Runs `operation` up to `policy.max_attempts` times.
///
/// Returns the first success. An error for which `is_retryable` is false is returned
/// immediately. When attempts run out, the last error is returned. The sleep between
/// attempts ends early when `ctx` is done, in which case the last error is returned
/// without another attempt.
pub async fn with_retry<T, E, F, Fut, P>(
    ctx: &CallContext,
    policy: &RetryPolicy,
    is_retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        attempt += 1;
        if attempt >= max_attempts || !is_retryable(&error) {
            return Err(error);
        }
        let delay = policy.delay_for_attempt(attempt - 1);
        #[cfg(feature = "telemetry")]
        tracing::debug!(attempt, max_attempts, ?delay, "Retryable error, will retry");
        if ctx.run(tokio::time::sleep(delay)).await.is_err() {
            return Err(error);
        }
    }
}
