//! Centralized retry/backoff helper shared by every external call site.
//!
//! The similarity index, the hypothesis scheduler, and the confirmation
//! engine all route their service calls through [`with_backoff`]; none of
//! them carries its own retry loop.

use std::thread;

use tracing::warn;

use crate::config::RetryPolicy;
use crate::errors::QuorumResult;

/// Run `op` up to `policy.max_attempts` times, sleeping with exponential
/// backoff between attempts. Only errors whose `is_retryable()` is true are
/// retried; the last error is returned once attempts are exhausted.
pub fn with_backoff<T, F>(policy: &RetryPolicy, what: &str, mut op: F) -> QuorumResult<T>
where
    F: FnMut() -> QuorumResult<T>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_err = None;

    for attempt in 1..=attempts {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < attempts => {
                let delay = policy.base_delay * 2u32.saturating_pow(attempt - 1);
                thread::sleep(delay);
                last_err = Some(err);
            }
            Err(err) => {
                if err.is_retryable() {
                    warn!(what, attempts, "retries exhausted: {err}");
                }
                return Err(err);
            }
        }
    }

    // Unreachable: the loop always returns. Kept for the type checker.
    Err(last_err.expect("retry loop exited without a result"))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::errors::QuorumError;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
            call_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn succeeds_first_try() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(&fast_policy(3), "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(&fast_policy(3), "op", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(QuorumError::Reasoning("flaky".into()))
            } else {
                Ok("done")
            }
        });
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn exhausts_retries() {
        let calls = AtomicU32::new(0);
        let result: QuorumResult<()> = with_backoff(&fast_policy(3), "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(QuorumError::Timeout("deadline".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn non_retryable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: QuorumResult<()> = with_backoff(&fast_policy(5), "op", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(QuorumError::Store("corrupt".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
