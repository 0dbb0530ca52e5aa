use std::{future::Future, time::Duration};

use storage::StoreResult;
use tracing::warn;

use crate::metrics::{Counter, FanoutMetrics};

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based): `initial * 2^attempt`, capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Runs `op` until it succeeds, fails with a non-transient error, or `attempts` tries
/// have been spent.
pub(crate) async fn retry_transient<T, F, Fut>(
    backoff: Backoff,
    attempts: u32,
    metrics: &FanoutMetrics,
    operation: &'static str,
    mut op: F,
) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempt + 1 < attempts => {
                let delay = backoff.delay(attempt);
                warn!(operation, attempt, ?delay, %error, "transient store error, retrying");
                metrics.incr(Counter::StoreRetries);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use storage::StoreError;

    use super::*;

    const BACKOFF: Backoff = Backoff {
        initial: Duration::from_millis(10),
        max: Duration::from_millis(100),
    };

    #[test]
    fn delay_doubles_until_capped() {
        assert_eq!(BACKOFF.delay(0), Duration::from_millis(10));
        assert_eq!(BACKOFF.delay(1), Duration::from_millis(20));
        assert_eq!(BACKOFF.delay(3), Duration::from_millis(80));
        assert_eq!(BACKOFF.delay(4), Duration::from_millis(100));
        assert_eq!(BACKOFF.delay(200), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let metrics = FanoutMetrics::default();
        let calls = &AtomicU32::new(0);
        let value = retry_transient(BACKOFF, 5, &metrics, "test", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StoreError::Unavailable("blip".into()))
            } else {
                Ok(7)
            }
        })
        .await
        .expect("value");
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.get(Counter::StoreRetries), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_and_exhaustion_surface() {
        let metrics = FanoutMetrics::default();
        let calls = &AtomicU32::new(0);
        let err = retry_transient(BACKOFF, 5, &metrics, "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(StoreError::InvalidLogKey)
        })
        .await
        .expect_err("permanent");
        assert!(matches!(err, StoreError::InvalidLogKey));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let err = retry_transient(BACKOFF, 3, &metrics, "test", || async {
            Err::<(), _>(StoreError::Unavailable("down".into()))
        })
        .await
        .expect_err("exhausted");
        assert!(err.is_transient());
    }
}
