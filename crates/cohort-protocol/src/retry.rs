/// Retry policy for transport operations.
///
/// Transient failures ([`TransportError::is_transient`]) are retried with
/// a Fibonacci-like delay schedule: `base × 1, 2, 3, 5, 8, …`, each step
/// clamped to `max_delay`. Permanent failures return immediately.
use std::future::Future;
use std::time::Duration;

use cohort_transport::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

/// The last error after the policy gave up.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{source} (after {attempts} attempts)")]
pub struct RetryExhausted {
    pub attempts: u32,
    #[source]
    pub source: TransportError,
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-indexed).
    pub fn delay(&self, retry: u32) -> Duration {
        let (mut cur, mut next) = (1u32, 2u32);
        for _ in 0..retry {
            if self.base_delay.saturating_mul(cur) >= self.max_delay {
                break;
            }
            let after = cur.saturating_add(next);
            cur = next;
            next = after;
        }
        self.base_delay.saturating_mul(cur).min(self.max_delay)
    }

    /// Run `attempt` until it succeeds, fails permanently, or attempts run out.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut attempt: F) -> Result<T, RetryExhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempts = 0;
        loop {
            attempts += 1;
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(source) if !source.is_transient() || attempts >= max_attempts => {
                    return Err(RetryExhausted { attempts, source });
                }
                Err(e) => {
                    let delay = self.delay(attempts - 1);
                    tracing::warn!(operation, attempts, ?delay, "transient failure, retrying: {e}");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(45),
        }
    }

    #[test]
    fn schedule_is_fibonacci_and_capped() {
        let p = policy(10);
        let delays: Vec<u64> = (0..6).map(|n| p.delay(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![10, 20, 30, 45, 45, 45]);
    }

    #[test]
    fn huge_retry_index_saturates() {
        let p = policy(10);
        assert_eq!(p.delay(u32::MAX), Duration::from_millis(45));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = policy(5)
            .run("join", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TransportError::Busy("bind".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = policy(5)
            .run("join", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::NotFound { group: "G".into() })
            })
            .await;
        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = policy(3)
            .run("send", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TransportError::Unreachable { group: "G".into() })
            })
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert!(err.source.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
