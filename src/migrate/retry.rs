use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

use crate::error::{SourceReadError, TargetWriteError};

/// Errors that know whether another attempt may succeed.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for SourceReadError {
    fn is_transient(&self) -> bool {
        SourceReadError::is_transient(self)
    }
}

impl Transient for TargetWriteError {
    fn is_transient(&self) -> bool {
        TargetWriteError::is_transient(self)
    }
}

/// Exponential backoff for transient read and write failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration, max_delay: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: if max_delay.is_zero() {
                base_delay
            } else {
                max_delay
            },
        }
    }

    /// Runs `op` until it succeeds, fails with a fatal error or runs out of attempts.
    /// The last error is returned as is.
    pub async fn run<F, Fut, T, E>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + std::fmt::Display,
    {
        let mut attempt = 0;

        loop {
            match op().await {
                Ok(result) => return Ok(result),
                Err(err) if !err.is_transient() => return Err(err),
                Err(err) => {
                    if attempt + 1 >= self.max_attempts {
                        warn!("{} failed after {} attempts: {}", what, attempt + 1, err);
                        return Err(err);
                    }

                    let delay = self.backoff_delay(attempt);
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {}ms: {}",
                        what,
                        attempt + 1,
                        self.max_attempts,
                        delay.as_millis(),
                        err
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    pub fn backoff_delay(&self, attempt: usize) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }

        let factor = 1u128 << attempt.min(16);
        let delay_ms = self.base_delay.as_millis().saturating_mul(factor);
        let capped = delay_ms.min(self.max_delay.as_millis());
        Duration::from_millis(capped as u64)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::ClientError;

    fn fast(max_attempts: usize) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(2))
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = RetryPolicy::new(8, Duration::from_millis(100), Duration::from_millis(1000));

        let delays: Vec<u128> = (0..6)
            .map(|attempt| policy.backoff_delay(attempt).as_millis())
            .collect();

        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = &AtomicUsize::new(0);

        let result = fast(5)
            .run("read page", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SourceReadError::query(
                        "users",
                        ClientError::Connection("reset".into()),
                    ))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let calls = &AtomicUsize::new(0);

        let result: Result<(), _> = fast(5)
            .run("write batch", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TargetWriteError::write(
                    "users",
                    ClientError::Rejected("syntax error".into()),
                ))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let calls = &AtomicUsize::new(0);

        let result: Result<(), _> = fast(3)
            .run("read page", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SourceReadError::query(
                    "users",
                    ClientError::Timeout(Duration::from_secs(1)),
                ))
            })
            .await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
