// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Bounded exponential backoff for store calls.
//!
//! Only [`StoreError::is_retryable`] failures are retried.  When the attempt
//! budget runs out the last error is surfaced as
//! [`TrialError::RetriesExhausted`]; nothing here ever waits unboundedly.

use std::time::Duration;

use crate::config::RetryPolicy;
use crate::error::{StoreError, TrialError};

impl RetryPolicy {
    /// Delay to wait after the `attempt`-th failure (1-based).
    ///
    /// ```rust
    /// use std::time::Duration;
    /// use trialgate_core::config::RetryPolicy;
    ///
    /// let policy = RetryPolicy { initial_backoff_ms: 100, max_backoff_ms: 250, ..RetryPolicy::default() };
    /// assert_eq!(policy.backoff(1), Duration::from_millis(100));
    /// assert_eq!(policy.backoff(2), Duration::from_millis(200));
    /// assert_eq!(policy.backoff(3), Duration::from_millis(250));
    /// ```
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let raw = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = raw.min(self.max_backoff_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// At least one attempt is always made.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Run `operation` until it succeeds, fails permanently, or the policy's
/// attempt budget is spent, sleeping the calling thread between attempts.
pub fn retry_blocking<T, F>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, TrialError>
where
    F: FnMut() -> Result<T, StoreError>,
{
    let attempts = policy.attempts();
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation() {
            Ok(value) => return Ok(value),
            Err(error) if error.is_retryable() && attempt < attempts => {
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "store call failed, retrying"
                );
                pause(delay);
            }
            Err(error) if error.is_retryable() => {
                tracing::error!(operation = operation_name, attempts, %error, "store retries exhausted");
                return Err(TrialError::RetriesExhausted {
                    attempts,
                    source: error,
                });
            }
            Err(error) => return Err(TrialError::Store(error)),
        }
    }
}

/// Block the calling thread for `delay`.
///
/// `wasm32-unknown-unknown` has no blocking sleep (the Workers and browser
/// event loops are single-threaded), so there the retry runs immediately
/// and only the attempt budget bounds it.
pub fn pause(delay: Duration) {
    #[cfg(not(target_arch = "wasm32"))]
    std::thread::sleep(delay);
    #[cfg(target_arch = "wasm32")]
    let _ = delay;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            multiplier: 2.0,
            timeout_ms: 50,
        }
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let mut calls = 0;
        let result = retry_blocking(&fast_policy(3), "get", || {
            calls += 1;
            if calls < 3 {
                Err(StoreError::Transient("flaky".into()))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn gives_up_after_budget() {
        let mut calls = 0;
        let result: Result<(), _> = retry_blocking(&fast_policy(3), "get", || {
            calls += 1;
            Err(StoreError::Timeout(50))
        });
        assert_eq!(calls, 3);
        assert!(matches!(result, Err(TrialError::RetriesExhausted { attempts: 3, .. })));
    }

    #[test]
    fn permanent_failures_are_not_retried() {
        let mut calls = 0;
        let result: Result<(), _> = retry_blocking(&fast_policy(5), "get", || {
            calls += 1;
            Err(StoreError::Permanent("corrupt".into()))
        });
        assert_eq!(calls, 1);
        assert!(matches!(result, Err(TrialError::Store(StoreError::Permanent(_)))));
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let policy = fast_policy(0);
        assert_eq!(policy.attempts(), 1);
    }
}
