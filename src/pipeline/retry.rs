//! Exponential backoff shared by every hosted-service call.
//!
//! The delay is `backoff_ms * 2^(attempt - 1)`, capped at one minute: with
//! 500 ms base and 3 retries the waits are 500 ms → 1 s → 2 s.
//! [`with_backoff`] only retries errors for which [`GuideError::is_retryable`]
//! holds, so a rejected voice or a bad key fails on the first attempt.
//! [`retry_when`] takes the predicate from the caller.

use crate::error::GuideError;
use std::future::Future;
use tokio::time::{sleep, Duration};
use tracing::warn;

/// Longest single wait between attempts.
pub const MAX_BACKOFF_MS: u64 = 60_000;

/// Run `op` until it succeeds, fails permanently, or retries run out.
pub async fn with_backoff<T, F, Fut>(
    label: &str,
    max_retries: u32,
    backoff_ms: u64,
    op: F,
) -> Result<T, GuideError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GuideError>>,
{
    retry_when(label, max_retries, backoff_ms, GuideError::is_retryable, op).await
}

/// Like [`with_backoff`], with the caller deciding which errors are retried.
pub async fn retry_when<T, F, Fut, R>(
    label: &str,
    max_retries: u32,
    backoff_ms: u64,
    retryable: R,
    mut op: F,
) -> Result<T, GuideError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GuideError>>,
    R: Fn(&GuideError) -> bool,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < max_retries && retryable(&e) => {
                attempt += 1;
                let backoff = delay_ms(backoff_ms, attempt);
                warn!(
                    "{}: attempt {} failed: {}; retry {}/{} after {}ms",
                    label, attempt, e, attempt, max_retries, backoff
                );
                sleep(Duration::from_millis(backoff)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Wait before retry number `attempt` (1-based), capped at [`MAX_BACKOFF_MS`].
pub(crate) fn delay_ms(backoff_ms: u64, attempt: u32) -> u64 {
    backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
        .min(MAX_BACKOFF_MS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> GuideError {
        GuideError::TtsApiError {
            status: 503,
            body: "overloaded".into(),
        }
    }

    #[tokio::test]
    async fn retries_transient_errors_then_succeeds() {
        let calls = AtomicU32::new(0);
        let out = with_backoff("test", 3, 1, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(transient())
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let err = with_backoff("test", 2, 1, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(transient())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, GuideError::TtsApiError { status: 503, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let err = with_backoff("test", 5, 1, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(GuideError::InvalidVoice {
                voice_id: "nope".into(),
            })
        })
        .await
        .unwrap_err();
        assert!(matches!(err, GuideError::InvalidVoice { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delay_doubles_and_saturates() {
        assert_eq!(delay_ms(500, 1), 500);
        assert_eq!(delay_ms(500, 3), 2000);
        assert_eq!(delay_ms(500, 70), MAX_BACKOFF_MS);
        assert_eq!(delay_ms(0, 200), 0);
    }

    #[tokio::test]
    async fn many_retries_do_not_overflow() {
        let calls = AtomicU32::new(0);
        let err = retry_when("test", 70, 0, |_| true, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(GuideError::Internal("always".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, GuideError::Internal(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 71);
    }
}
