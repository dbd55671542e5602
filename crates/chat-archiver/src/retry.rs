//! Bounded exponential backoff for transient failures.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::{is_transient, retry_after, ArchiveError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), with up to 25% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self.base_delay.saturating_mul(1u32 << exp).min(self.max_delay);
        let jitter_ms = (base.as_millis() as u64) / 4;
        let jitter = if jitter_ms > 0 { rand::thread_rng().gen_range(0..=jitter_ms) } else { 0 };
        base + Duration::from_millis(jitter)
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or the
    /// attempts run out. Exhaustion is reported as [`ArchiveError::RetriesExhausted`].
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) => {
                    if attempt >= self.max_attempts {
                        return Err(ArchiveError::RetriesExhausted {
                            attempts: attempt,
                            last_error: format!("{}: {:#}", what, e),
                        }
                        .into());
                    }
                    let delay = retry_after(&e).unwrap_or_else(|| self.delay_for(attempt));
                    warn!("{} failed (attempt {}/{}): {:#}. Retrying in {:?}", what, attempt, self.max_attempts, e, delay);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy { max_attempts: 3, base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(5) }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy { max_attempts: 10, base_delay: Duration::from_millis(100), max_delay: Duration::from_secs(1) };
        let first = policy.delay_for(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        let third = policy.delay_for(3);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(500));
        assert!(policy.delay_for(30) <= Duration::from_millis(1250));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result = fast()
            .run("op", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ClientError::Transient("flaky".into()).into())
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_is_fatal() {
        let calls = AtomicU32::new(0);
        let result: anyhow::Result<()> = fast()
            .run("op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ClientError::Transient("down".into()).into())
            })
            .await;
        let err = result.unwrap_err();
        assert!(matches!(err.downcast_ref::<ArchiveError>(), Some(ArchiveError::RetriesExhausted { attempts: 3, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: anyhow::Result<()> = fast()
            .run("op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ClientError::Fatal("nope".into()).into())
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
