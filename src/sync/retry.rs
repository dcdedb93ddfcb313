//! Bounded retry with exponential backoff for remote calls.

use std::future::Future;
use std::time::Duration;

use super::remote::RemoteError;

/// Upper bound on a single backoff sleep
const MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles after each failure
    pub base_delay: Duration,
    /// Each attempt is abandoned after this long
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `attempt + 1`, where `attempt` starts at 1
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(MAX_DELAY)
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or runs out
/// of attempts.
///
/// Each attempt is bounded by `attempt_timeout`. Exhausting the attempts on
/// transient errors yields `RemoteError::Unreachable`; anything else (conflict,
/// authorization, bad payload) is returned as-is on first sight.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let result = match tokio::time::timeout(policy.attempt_timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout(policy.attempt_timeout)),
        };

        match result {
            Ok(value) => {
                if attempt > 1 {
                    log::info!("Remote: {} succeeded on attempt {}", operation, attempt);
                }
                return Ok(value);
            }
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = policy.delay_after(attempt);
                log::warn!(
                    "Remote: {} failed ({}), retrying in {:?} ({}/{})",
                    operation,
                    e,
                    delay,
                    attempt,
                    max_attempts
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) if e.is_transient() => {
                log::error!("Remote: {} gave up after {} attempts: {}", operation, attempt, e);
                return Err(RemoteError::Unreachable {
                    attempts: attempt,
                    last: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }
}
