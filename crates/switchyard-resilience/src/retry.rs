//! Bounded retry with classified errors and jittered exponential backoff.
//!
//! The executor owns the attempt loop around a single back-end call. Errors
//! are mapped to a closed [`ErrorClass`] by a caller-supplied classifier;
//! the class alone decides whether and how an attempt is retried.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Closed classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Provider rate limit; honor its Retry-After when supplied.
    RateLimit { retry_after_secs: Option<u64> },
    /// Provider 5xx.
    ServerError,
    /// Attempt deadline elapsed. Retried once with a doubled timeout budget.
    Timeout,
    /// Transport failure.
    Connection,
    /// Provider 4xx (excluding auth and not-found). Retried once without
    /// backoff when the policy allows it.
    Validation,
    /// Never retried.
    Auth,
    /// Never retried.
    NotFound,
    /// Unrecognized shape; retried with backoff.
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Per-attempt deadline handed to the operation; doubled after a
    /// timeout-class failure.
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    /// Whether a validation-class (4xx) failure gets a single immediate
    /// retry. Deployments that want fail-fast semantics turn this off.
    #[serde(default = "default_retry_validation")]
    pub retry_validation: bool,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    2_000
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_attempt_timeout_ms() -> u64 {
    120_000
}
fn default_retry_validation() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            retry_validation: default_retry_validation(),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the retry following attempt `n` (0-based):
    /// `min(base · 2^n, max)` with ±10% jitter applied by the executor.
    fn backoff(&self, n: u32) -> Duration {
        let base = self.base_delay_ms.saturating_mul(1u64 << n.min(20));
        Duration::from_millis(base.min(self.max_delay_ms))
    }
}

/// One slot in the attempt loop, passed to the operation.
#[derive(Debug, Clone, Copy)]
pub struct Attempt {
    /// 1-based attempt number.
    pub number: u32,
    /// Deadline budget for this attempt.
    pub timeout: Duration,
}

#[derive(Debug)]
pub enum RetryError<E> {
    /// The surrounding cancellation fired between or during attempts.
    Cancelled,
    /// Attempts are exhausted or the class was terminal; carries the last
    /// observed error and the number of attempts made.
    Failed { error: E, attempts: u32 },
}

/// Run `op` under `policy`, classifying failures with `classify`.
///
/// At most `policy.max_attempts` attempts are made. One sleep never exceeds
/// `max_delay_ms`, and a provider Retry-After is honored when it is larger
/// than the computed backoff (still clamped to the max).
pub async fn run_with_retry<T, E, C, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    classify: C,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    C: Fn(&E) -> ErrorClass,
    F: FnMut(Attempt) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut timeout = Duration::from_millis(policy.attempt_timeout_ms);
    let mut timeout_retry_used = false;
    let mut validation_retry_used = false;
    let mut attempt = 1u32;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            result = op(Attempt {
                number: attempt,
                timeout,
            }) => result,
        };

        let error = match result {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if attempt >= policy.max_attempts {
            return Err(RetryError::Failed {
                error,
                attempts: attempt,
            });
        }

        let class = classify(&error);
        let delay = match class {
            ErrorClass::Auth | ErrorClass::NotFound => {
                return Err(RetryError::Failed {
                    error,
                    attempts: attempt,
                });
            }
            ErrorClass::Validation => {
                if !policy.retry_validation || validation_retry_used {
                    return Err(RetryError::Failed {
                        error,
                        attempts: attempt,
                    });
                }
                validation_retry_used = true;
                Duration::ZERO
            }
            ErrorClass::Timeout => {
                if timeout_retry_used {
                    return Err(RetryError::Failed {
                        error,
                        attempts: attempt,
                    });
                }
                timeout_retry_used = true;
                timeout = timeout.saturating_mul(2);
                policy.backoff(attempt - 1)
            }
            ErrorClass::RateLimit { retry_after_secs } => {
                let computed = policy.backoff(attempt - 1);
                let supplied = retry_after_secs.map(Duration::from_secs).unwrap_or_default();
                computed
                    .max(supplied)
                    .min(Duration::from_millis(policy.max_delay_ms))
            }
            ErrorClass::ServerError | ErrorClass::Connection | ErrorClass::Unknown => {
                policy.backoff(attempt - 1)
            }
        };

        debug!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "retrying after classified failure"
        );

        if !delay.is_zero() {
            let jittered = apply_jitter(delay).min(Duration::from_millis(policy.max_delay_ms));
            tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                _ = tokio::time::sleep(jittered) => {}
            }
        }

        attempt += 1;
    }
}

/// ±10% jitter. The caller clamps the result to the policy maximum.
fn apply_jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.9..=1.1);
    delay.mul_f64(factor)
}
