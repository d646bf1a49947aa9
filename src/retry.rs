//! Start-up retries.
//!
//! The syncer boots next to the embedded control plane and usually wins the
//! race: the first client calls land before the virtual API server accepts
//! connections. Operations that must eventually succeed at start-up retry
//! with jittered exponential backoff.

use std::time::Duration;

use rand::Rng;
use tracing::warn;

const INITIAL_DELAY: Duration = Duration::from_millis(250);
const MAX_DELAY: Duration = Duration::from_secs(10);

/// Retry an async operation until it succeeds or `max_attempts` is
/// exhausted (0 retries forever). Jitter spreads concurrent starters.
pub async fn with_backoff<F, Fut, T, E>(
    operation_name: &str,
    max_attempts: u32,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = INITIAL_DELAY;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        if max_attempts > 0 && attempt >= max_attempts {
            return Err(error);
        }

        let jittered = delay.mul_f64(rand::rng().random_range(0.5..1.5));
        warn!(
            operation = operation_name,
            attempt,
            delay_ms = jittered.as_millis(),
            error = %error,
            "operation failed, retrying"
        );
        tokio::time::sleep(jittered).await;
        delay = (delay * 2).min(MAX_DELAY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn returns_first_success() {
        let result: Result<i32, &str> = with_backoff("op", 3, || async { Ok(7) }).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = with_backoff("op", 10, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("not yet")
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = with_backoff("op", 2, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("always") }
        })
        .await;
        assert_eq!(result, Err("always"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
