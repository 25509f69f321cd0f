//! Bounded retries, keyed by why an attempt failed
//!
//! Provider calls and ledger transactions fail for different reasons and
//! recover on different clocks. A dropped connection or a throttled API
//! needs seconds; a writer holding the SQLite lock is usually gone within
//! milliseconds. Each error type reports a [`RetryClass`] and each call site
//! picks a [`RetryPolicy`] naming the classes it is willing to repeat.

use std::fmt::Display;
use std::future::Future;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Timeout, reset connection or provider maintenance
    Network,
    /// The provider asked us to slow down
    Throttled,
    /// Another writer held the database, or a guarded update lost a race
    LockConflict,
}

/// Errors that can say whether repeating the attempt may succeed
pub trait Retryable {
    fn retry_class(&self) -> Option<RetryClass>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub retry_on: &'static [RetryClass],
}

impl RetryPolicy {
    /// HTTP calls to the game provider
    pub fn provider() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            retry_on: &[RetryClass::Network, RetryClass::Throttled],
        }
    }

    /// One ledger transaction: settle a contest, post a record, apply a balance
    pub fn ledger() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(800),
            retry_on: &[RetryClass::LockConflict],
        }
    }

    /// Delay before attempt `attempt + 1`
    fn delay(&self, class: RetryClass, attempt: u32) -> Duration {
        let base = match class {
            RetryClass::Throttled => self.base_delay * 4,
            RetryClass::Network | RetryClass::LockConflict => self.base_delay,
        };
        let factor = 1u32 << attempt.saturating_sub(1).min(10);
        base.saturating_mul(factor).min(self.max_delay)
    }

    fn allows(&self, class: Option<RetryClass>) -> Option<RetryClass> {
        class.filter(|c| self.retry_on.contains(c))
    }
}

/// Run `op` until it succeeds, fails with a class the policy does not cover,
/// or runs out of attempts. The last error is returned unchanged.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, E>
where
    E: Retryable + Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;

    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let Some(class) = policy.allows(err.retry_class()) else {
            return Err(err);
        };
        if attempt >= policy.max_attempts {
            warn!("[Retry] {} gave up after {} attempts ({:?}): {}", label, attempt, class, err);
            return Err(err);
        }

        let delay = policy.delay(class, attempt);
        debug!(
            "[Retry] {} attempt {}/{} hit {:?} ({}), next in {:?}",
            label, attempt, policy.max_attempts, class, err, delay
        );
        sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::provider_errors::ProviderError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn quick(retry_on: &'static [RetryClass]) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(10),
            retry_on,
        }
    }

    #[tokio::test]
    async fn test_provider_timeout_recovers() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result = retry(&quick(&[RetryClass::Network]), "list_bets", || {
            let n = c.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ProviderError::NetworkError("Request timed out".to_string()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_policy_ignores_classes_it_does_not_cover() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        // A ledger policy never re-sends provider requests
        let result = retry(&quick(&[RetryClass::LockConflict]), "get_balance", || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(ProviderError::Unavailable) }
        })
        .await;

        assert!(matches!(result, Err(ProviderError::Unavailable)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_permanent_error_fails_at_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result = retry(&RetryPolicy::provider(), "get_balance", || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(ProviderError::AuthenticationFailed) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result = retry(&quick(&[RetryClass::Network]), "query_draw_results", || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(ProviderError::NetworkError("reset".to_string())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy::provider();
        assert_eq!(policy.delay(RetryClass::Network, 1), Duration::from_millis(250));
        assert_eq!(policy.delay(RetryClass::Network, 2), Duration::from_millis(500));
        assert_eq!(policy.delay(RetryClass::Throttled, 1), Duration::from_secs(1));
        assert_eq!(policy.delay(RetryClass::Throttled, 9), Duration::from_secs(5));
    }
}
