#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **eld-retry** – Retry Engine (spec §4.7).
//!
//! Exponential backoff with jitter over a caller-supplied fallible operation,
//! short-circuiting on errors classified as permanent. Shaped after the
//! token-bucket limiter's config/state split, with the bucket-consumption
//! loop replaced by a backoff-and-retry loop.

use rand::Rng;
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Likely to succeed on retry: network blips, connection-pool exhaustion,
    /// transaction contention, a transient 503 upstream.
    Transient,
    /// Will not succeed on retry without a different input or operator
    /// intervention: validation, uniqueness/constraint violations, auth.
    Permanent,
}

/// Backoff policy (spec §4.7 defaults: base=1000ms, max=30000ms, attempts=3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Base delay in milliseconds.
    pub base_ms: u64,
    /// Maximum delay in milliseconds (before jitter).
    pub max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_ms: 1000,
            max_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (1-indexed), per
    /// `min(base * 2^(attempt-1), max) + uniform[0, min(base/2, 500ms)]`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self
            .base_ms
            .saturating_mul(1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX));
        let capped = exp.min(self.max_ms);
        let jitter_bound = (self.base_ms / 2).min(500);
        let jitter = if jitter_bound == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_bound)
        };
        Duration::from_millis(capped + jitter)
    }
}

/// Classify an error by matching its rendered message against the curated
/// transient substrings from spec §4.7. Anything unmatched is permanent.
pub fn classify_by_message(message: &str) -> ErrorClass {
    const TRANSIENT_SUBSTRINGS: &[&str] = &[
        "ECONNREFUSED",
        "ETIMEDOUT",
        "ENOTFOUND",
        "ENETUNREACH",
        "ECONNRESET",
        "socket closed",
        "socket hang up",
        "fetch failed",
        "deadlock",
        "serialization failure",
        "too many connections",
        "server closed the connection",
        "503",
    ];
    let lower = message.to_lowercase();
    if TRANSIENT_SUBSTRINGS
        .iter()
        .any(|needle| lower.contains(&needle.to_lowercase()))
    {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

/// Run `operation`, retrying on transient failures per `policy`, using
/// `classify` to tell transient from permanent errors. Permanent errors are
/// re-thrown on the first attempt. Every attempt is logged with its number,
/// classification and (if retrying) the delay before the next one.
pub async fn retry<T, E, F, Fut>(
    mut operation: F,
    policy: RetryPolicy,
    classify: impl Fn(&E) -> ErrorClass,
) -> Result<T, E>
where
    E: Debug,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let class = classify(&err);
                debug!(attempt, ?class, error = ?err, "operation attempt failed");

                if class == ErrorClass::Permanent || attempt >= policy.max_attempts {
                    return Err(err);
                }

                let delay = policy.delay_for_attempt(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after backoff");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn classifies_network_errors_as_transient() {
        assert_eq!(classify_by_message("connect ECONNREFUSED 127.0.0.1:5432"), ErrorClass::Transient);
        assert_eq!(classify_by_message("deadlock detected"), ErrorClass::Transient);
        assert_eq!(classify_by_message("upstream returned 503"), ErrorClass::Transient);
    }

    #[test]
    fn classifies_constraint_violations_as_permanent() {
        assert_eq!(classify_by_message("duplicate key value violates unique constraint"), ErrorClass::Permanent);
        assert_eq!(classify_by_message("permission denied for relation eld_events"), ErrorClass::Permanent);
        assert_eq!(classify_by_message("null value in column violates not-null constraint"), ErrorClass::Permanent);
    }

    #[test]
    fn delay_grows_exponentially_and_caps_at_max() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_ms: 1000,
            max_ms: 3000,
        };
        assert!(policy.delay_for_attempt(1).as_millis() >= 1000);
        assert!(policy.delay_for_attempt(1).as_millis() < 1500);
        assert!(policy.delay_for_attempt(4).as_millis() >= 3000);
        assert!(policy.delay_for_attempt(4).as_millis() < 3500);
    }

    #[tokio::test]
    async fn permanent_error_short_circuits_on_first_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("duplicate key value violates unique constraint") }
            },
            RetryPolicy::default(),
            |e: &&str| classify_by_message(e),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_error_retries_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 5,
            base_ms: 1,
            max_ms: 2,
        };
        let result = retry(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("ECONNRESET")
                    } else {
                        Ok(42)
                    }
                }
            },
            policy,
            |e: &&str| classify_by_message(e),
        )
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn transient_error_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            base_ms: 1,
            max_ms: 2,
        };
        let result: Result<(), &str> = retry(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("ETIMEDOUT") }
            },
            policy,
            |e: &&str| classify_by_message(e),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
