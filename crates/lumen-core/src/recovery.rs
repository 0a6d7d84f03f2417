use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error_classifier::{classify, ClassifiedError, ErrorContext, RawFailure};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
        }
    }

    /// Linear backoff: the wait after attempt `n` is `base × n`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(u64::from(attempt)))
    }
}

#[derive(Debug)]
pub struct Recovered<T> {
    pub outcome: Result<T, ClassifiedError>,
    pub attempts: u32,
}

impl<T> Recovered<T> {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Runs `op` until it succeeds, the failure is classified as not retryable,
/// or the policy runs out of attempts. `op` receives the 1-based attempt.
pub async fn with_recovery<T, F, Fut>(
    policy: RetryPolicy,
    context: &ErrorContext,
    mut op: F,
) -> Recovered<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, RawFailure>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => {
                return Recovered {
                    outcome: Ok(value),
                    attempts: attempt,
                }
            }
            Err(failure) => {
                let classified = classify(&failure, &context.clone().with_attempt(attempt));
                if !classified.retryable || attempt >= max_attempts {
                    return Recovered {
                        outcome: Err(classified),
                        attempts: attempt,
                    };
                }
                let delay = policy.delay_after(attempt);
                tracing::debug!(
                    attempt,
                    kind = classified.kind.as_str(),
                    delay_ms = delay.as_millis() as u64,
                    "retrying after classified failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_classifier::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn retries_retryable_failures_with_linear_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();
        let counter = calls.clone();
        let recovered = with_recovery(RetryPolicy::default(), &ErrorContext::default(), |_| {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(RawFailure::new("connection reset"))
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(recovered.attempts, 3);
        assert_eq!(recovered.retries(), 2);
        assert_eq!(recovered.outcome.expect("ok"), "done");
        // 1s after the first failure, 2s after the second.
        assert_eq!(started.elapsed(), Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_first_non_retryable_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let recovered: Recovered<()> =
            with_recovery(RetryPolicy::default(), &ErrorContext::default(), |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(RawFailure::new("quota exhausted"))
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let err = recovered.outcome.expect_err("error");
        assert_eq!(err.kind, ErrorKind::QuotaExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn surfaces_last_error_after_exhausting_attempts() {
        let recovered: Recovered<()> = with_recovery(
            RetryPolicy {
                max_attempts: 2,
                base_delay_ms: 10,
            },
            &ErrorContext::default(),
            |attempt| async move {
                if attempt == 1 {
                    Err(RawFailure::new("network down"))
                } else {
                    Err(RawFailure::new("internal server error"))
                }
            },
        )
        .await;
        assert_eq!(recovered.attempts, 2);
        assert_eq!(
            recovered.outcome.expect_err("error").kind,
            ErrorKind::ServerError
        );
    }

    #[test]
    fn delay_grows_linearly() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 250,
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(250));
        assert_eq!(policy.delay_after(3), Duration::from_millis(750));
        assert_eq!(RetryPolicy::no_retry().max_attempts, 1);
    }
}
