//! Bounded exponential backoff for claim and proof submission.

use super::SessionsError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let ms = self
            .initial_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Run `f` until it succeeds, `max_attempts` is reached or `cancel` fires.
///
/// Each wait adds up to 25% random jitter so that nodes retrying against the
/// same endpoint spread out.
pub async fn retry_with_backoff<T, E, F, Fut>(
    config: &RetryConfig,
    op: &str,
    cancel: &CancellationToken,
    mut f: F,
) -> Result<T, SessionsError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let err = match f().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if attempt >= max_attempts {
            return Err(SessionsError::RetriesExhausted {
                op: op.to_string(),
                attempts: attempt,
                last_error: err.to_string(),
            });
        }

        let base = config.delay_for(attempt);
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
        let delay = base + Duration::from_millis(jitter_ms);
        warn!(
            op,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Operation failed, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(SessionsError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 4,
            initial_delay_ms: 1,
            max_delay_ms: 4,
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let cfg = RetryConfig::default();
        assert_eq!(cfg.delay_for(1), Duration::from_millis(500));
        assert_eq!(cfg.delay_for(2), Duration::from_millis(1000));
        assert_eq!(cfg.delay_for(3), Duration::from_millis(2000));
        assert_eq!(cfg.delay_for(20), Duration::from_millis(30_000));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let result = retry_with_backoff(&fast(), "submit_claim", &cancel, || {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("unavailable")
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let result: Result<(), _> = retry_with_backoff(&fast(), "submit_proof", &cancel, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("failure {}", n)) }
        })
        .await;

        match result {
            Err(SessionsError::RetriesExhausted {
                op,
                attempts,
                last_error,
            }) => {
                assert_eq!(op, "submit_proof");
                assert_eq!(attempts, 4);
                assert_eq!(last_error, "failure 3");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancellation_stops_retries() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let cfg = RetryConfig {
            max_attempts: 10,
            initial_delay_ms: 60_000,
            max_delay_ms: 60_000,
        };
        let result: Result<(), _> =
            retry_with_backoff(&cfg, "op", &cancel, || async { Err("down") }).await;
        assert!(matches!(result, Err(SessionsError::Cancelled)));
    }
}
