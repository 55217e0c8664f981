//! Bounded retry with exponential backoff and a rate-limit cool-down.
//!
//! [`with_retry`] decorates any fallible async call. It knows nothing about
//! the business logic behind the call; it only inspects the returned
//! [`StageError`]:
//!
//! - non-retryable errors (bad input, missing upstream data) return at once;
//! - retryable errors wait `base_delay × multiplier^(n-1)` (capped at
//!   `max_delay`) before attempt `n + 1`;
//! - the first rate-limit error waits the longer cool-down instead, after
//!   which the normal schedule resumes.
//!
//! With the defaults (500 ms base, ×2, 3 attempts) a flaky call waits
//! 500 ms → 1 s between attempts; a 429 waits 30 s once.

use crate::error::StageError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// How many times to try and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Default: 3.
    pub max_attempts: u32,
    /// Delay after the first failed attempt. Default: 500 ms.
    pub base_delay: Duration,
    /// Growth factor between consecutive delays. Default: 2.
    pub multiplier: u32,
    /// Upper bound for a single backoff delay. Default: 8 s.
    pub max_delay: Duration,
    /// One-off wait applied to the first rate-limit error. Default: 30 s.
    pub rate_limit_cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            multiplier: 2,
            max_delay: Duration::from_secs(8),
            rate_limit_cooldown: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy with every delay set to zero.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            multiplier: 2,
            max_delay: Duration::ZERO,
            rate_limit_cooldown: Duration::ZERO,
        }
    }

    /// Normal backoff after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let factor = self.multiplier.max(1).saturating_pow(exp);
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay.max(self.base_delay))
    }

    /// Delay before the next attempt, given the error just observed.
    ///
    /// `cooled_down` tells whether the rate-limit cool-down was already spent.
    pub fn delay_after(&self, attempt: u32, err: &StageError, cooled_down: bool) -> Duration {
        if err.is_rate_limit() && !cooled_down {
            let server = err
                .retry_after_secs()
                .map(Duration::from_secs)
                .unwrap_or(Duration::ZERO);
            self.rate_limit_cooldown.max(server)
        } else {
            self.backoff(attempt)
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or runs out of attempts.
///
/// `label` identifies the call in logs (e.g. `"report.pdf/page_summary"`).
/// When attempts are exhausted the last error is returned unchanged.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, StageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StageError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut cooled_down = false;
    let mut attempt = 0;

    loop {
        attempt += 1;
        let err = match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{}: succeeded on attempt {}", label, attempt);
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if !err.is_retryable() {
            return Err(err);
        }
        if attempt >= max_attempts {
            warn!("{}: giving up after {} attempts: {}", label, attempt, err);
            return Err(err);
        }

        let delay = policy.delay_after(attempt, &err, cooled_down);
        if err.is_rate_limit() && !cooled_down {
            cooled_down = true;
            warn!(
                "{}: rate limited, cooling down for {}s before attempt {}/{}",
                label,
                delay.as_secs(),
                attempt + 1,
                max_attempts
            );
        } else {
            warn!(
                "{}: attempt {}/{} failed ({}), retrying in {}ms",
                label,
                attempt,
                max_attempts,
                err,
                delay.as_millis()
            );
        }
        sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn flaky() -> StageError {
        StageError::external("llm", "connection reset")
    }

    fn rate_limited() -> StageError {
        StageError::external("llm", "429 Too Many Requests")
    }

    #[tokio::test]
    async fn always_failing_call_is_attempted_exactly_three_times() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&RetryPolicy::immediate(3), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(flaky())
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(result, Err(StageError::ExternalService { .. })));
    }

    #[tokio::test]
    async fn recovers_after_transient_failure() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&RetryPolicy::immediate(3), "test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(flaky())
            } else {
                Ok("done")
            }
        })
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&RetryPolicy::immediate(3), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StageError::MalformedInput("page 0".into()))
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(StageError::MalformedInput(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_cools_down_once_then_backs_off() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            multiplier: 2,
            max_delay: Duration::from_secs(5),
            rate_limit_cooldown: Duration::from_secs(30),
        };
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        let result: Result<(), _> = with_retry(&policy, "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(rate_limited())
        })
        .await;

        // 30 s cool-down after attempt 1, then normal backoff of 200 ms after attempt 2.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(result.unwrap_err().is_rate_limit());
        assert_eq!(start.elapsed(), Duration::from_millis(30_200));
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(3), Duration::from_millis(2000));
        assert_eq!(policy.backoff(10), Duration::from_secs(8));
    }

    #[test]
    fn server_retry_after_extends_cooldown() {
        let policy = RetryPolicy::default();
        let err = StageError::RateLimit {
            service: "llm".into(),
            message: "slow down".into(),
            retry_after_secs: Some(90),
        };
        assert_eq!(policy.delay_after(1, &err, false), Duration::from_secs(90));
        assert_eq!(policy.delay_after(1, &err, true), Duration::from_millis(500));
    }
}
