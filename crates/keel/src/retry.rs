//! Bounded exponential retry for cluster writes and sync attempts.
//!
//! The delay starts at `duration`, is multiplied by `factor` after every
//! failed attempt and is capped at `max_duration`. Only errors the caller
//! classifies as retryable are retried.

use std::time::Duration;

use crate::config::duration::parse_duration;
use crate::error::ConfigError;
use crate::events::CancelToken;
use crate::resource::{BackoffSpec, RetrySpec};

/// Parsed retry policy of an Application.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Negative means unlimited.
    pub limit: i64,
    pub initial_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: 5,
            initial_delay: Duration::from_secs(5),
            factor: 2.0,
            max_delay: Duration::from_secs(180),
        }
    }
}

impl RetryPolicy {
    pub fn from_spec(spec: &RetrySpec) -> Result<Self, ConfigError> {
        let backoff = spec.backoff.clone().unwrap_or_default();
        Self::from_parts(spec.limit, &backoff)
    }

    fn from_parts(limit: i64, backoff: &BackoffSpec) -> Result<Self, ConfigError> {
        let factor = if backoff.factor < 1.0 {
            log::warn!(
                "Backoff factor {} is below 1, using 1 instead",
                backoff.factor
            );
            1.0
        } else {
            backoff.factor
        };
        Ok(Self {
            limit,
            initial_delay: parse_duration(&backoff.duration)?,
            factor,
            max_delay: parse_duration(&backoff.max_duration)?,
        })
    }

    /// Resolves an Application's policy, falling back to `default` when it
    /// declares none or an invalid one.
    pub fn resolve(spec: Option<&RetrySpec>, default: &RetryPolicy) -> RetryPolicy {
        match spec.map(Self::from_spec) {
            Some(Ok(policy)) => policy,
            Some(Err(e)) => {
                log::warn!("Invalid retry policy ({}), using controller default", e);
                default.clone()
            }
            None => default.clone(),
        }
    }

    /// Total attempts allowed, `None` when unlimited.
    pub fn max_attempts(&self) -> Option<u32> {
        if self.limit < 0 {
            None
        } else {
            Some(u32::try_from(self.limit).unwrap_or(u32::MAX).saturating_add(1))
        }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = self.factor.powi(i32::try_from(retry).unwrap_or(i32::MAX));
        let secs = (self.initial_delay.as_secs_f64() * exp).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            limit: 0,
            ..Self::default()
        }
    }
}

/// Outcome of a retried operation.
#[derive(Debug)]
pub struct Attempted<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

/// Runs `operation` until it succeeds, fails with a non-retryable error,
/// exhausts the policy or `cancel` fires.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    cancel: &CancelToken,
    is_retryable: impl Fn(&E) -> bool,
    mut operation: F,
) -> Attempted<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(e) => {
                let exhausted = policy.max_attempts().is_some_and(|max| attempt >= max);
                if !is_retryable(&e) || exhausted || cancel.is_cancelled() {
                    if exhausted && is_retryable(&e) {
                        log::error!(
                            "{} failed after {} attempt(s): {}",
                            operation_name,
                            attempt,
                            e
                        );
                    }
                    return Attempted {
                        result: Err(e),
                        attempts: attempt,
                    };
                }
                let delay = policy.delay_for(attempt - 1);
                log::warn!(
                    "{} failed (attempt {}), retrying in {}ms: {}",
                    operation_name,
                    attempt,
                    delay.as_millis(),
                    e
                );
                if !cancel.sleep(delay).await {
                    return Attempted {
                        result: Err(e),
                        attempts: attempt,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(limit: i64) -> RetryPolicy {
        RetryPolicy {
            limit,
            initial_delay: Duration::from_millis(1),
            factor: 2.0,
            max_delay: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_from_spec_parses_durations() {
        let spec = RetrySpec {
            limit: 3,
            backoff: Some(BackoffSpec {
                duration: "10s".into(),
                factor: 3.0,
                max_duration: "1m".into(),
            }),
        };
        let policy = RetryPolicy::from_spec(&spec).unwrap();
        assert_eq!(policy.initial_delay, Duration::from_secs(10));
        assert_eq!(policy.delay_for(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for(2), Duration::from_secs(60));
        assert_eq!(policy.delay_for(5), Duration::from_secs(60));
        assert_eq!(policy.max_attempts(), Some(4));
    }

    #[test]
    fn test_invalid_spec_falls_back() {
        let spec = RetrySpec {
            limit: 2,
            backoff: Some(BackoffSpec {
                duration: "soon".into(),
                ..Default::default()
            }),
        };
        let default = RetryPolicy::default();
        assert_eq!(RetryPolicy::resolve(Some(&spec), &default), default);
        assert_eq!(RetryPolicy::resolve(None, &default), default);
    }

    #[test]
    fn test_unlimited_and_none() {
        assert_eq!(fast(-1).max_attempts(), None);
        assert_eq!(RetryPolicy::none().max_attempts(), Some(1));
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let outcome = retry_with_backoff(&fast(5), "op", &CancelToken::new(), |_: &&str| true, || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("fail")
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(outcome.result, Ok(42));
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_exhausts_limit() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let outcome: Attempted<(), &str> =
            retry_with_backoff(&fast(2), "op", &CancelToken::new(), |_| true, || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("always fails")
                }
            })
            .await;
        assert_eq!(outcome.result, Err("always fails"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let outcome: Attempted<(), &str> =
            retry_with_backoff(&fast(5), "op", &CancelToken::new(), |_| false, || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("rejected")
                }
            })
            .await;
        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_retries() {
        let cancel = CancelToken::new();
        cancel.cancel("application deleted");
        let outcome: Attempted<(), &str> =
            retry_with_backoff(&fast(-1), "op", &cancel, |_| true, || async { Err("down") })
                .await;
        assert_eq!(outcome.attempts, 1);
    }
}
