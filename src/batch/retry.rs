//! Retry decisions for failed operations.

use std::fmt::Debug;
use std::time::Duration;

use crate::batch::executor::OperationError;
use crate::batch::types::Operation;

/// Outcome of consulting a [`RetryPolicy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    /// Whether another attempt should be made
    pub retry: bool,
    /// Wait before the next attempt; zero when `retry` is false
    pub delay: Duration,
}

impl RetryDecision {
    /// Retry after waiting `delay`
    pub fn retry_after(delay: Duration) -> Self {
        Self { retry: true, delay }
    }

    /// Make the failure terminal
    pub fn give_up() -> Self {
        Self {
            retry: false,
            delay: Duration::ZERO,
        }
    }
}

/// Decides whether a failed operation gets another attempt.
///
/// The executor decrements the operation's retry budget itself after a positive
/// decision, so policies only read `remaining_retries`.
pub trait RetryPolicy: Send + Sync + Debug {
    /// `attempt` is the 1-based number of the attempt that just failed
    fn should_retry(&self, operation: &Operation, error: &OperationError, attempt: u32) -> RetryDecision;

    /// Rewrite the operation before the next attempt, e.g. to substitute settings.
    ///
    /// Returning `None` means no usable operation could be produced and the failure
    /// becomes terminal regardless of the remaining budget.
    fn recover(&self, operation: &Operation, _error: &OperationError) -> Option<Operation> {
        Some(operation.clone())
    }
}

/// Backoff strategy for retries
#[derive(Debug, Clone, PartialEq, Default)]
pub enum BackoffStrategy {
    /// Retry immediately
    #[default]
    None,
    /// Same delay before every retry
    Fixed(Duration),
    /// `base`, then `base + increment`, `base + 2 * increment`, ...
    Linear {
        /// Delay before the first retry
        base: Duration,
        /// Added per further retry
        increment: Duration,
    },
    /// `base * multiplier^(retry - 1)`, capped at `max`
    Exponential {
        /// Delay before the first retry
        base: Duration,
        /// Growth factor per retry; values below 1 are treated as 1
        multiplier: f64,
        /// Upper bound for any delay
        max: Duration,
    },
}

impl BackoffStrategy {
    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        match self {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Fixed(delay) => *delay,
            BackoffStrategy::Linear { base, increment } => {
                base.saturating_add(increment.saturating_mul(retry - 1))
            }
            BackoffStrategy::Exponential { base, multiplier, max } => {
                let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
                let nanos = base.as_nanos() as f64 * multiplier.max(1.0).powi(exponent);
                if !nanos.is_finite() || nanos >= max.as_nanos() as f64 {
                    *max
                } else {
                    Duration::from_nanos(nanos.round() as u64)
                }
            }
        }
    }
}

/// Retries handler failures while the operation has budget left.
///
/// Validation errors, unavailable documents and unknown kinds are never retried.
#[derive(Debug, Clone, Default)]
pub struct DefaultRetryPolicy {
    backoff: BackoffStrategy,
    jitter: bool,
}

impl DefaultRetryPolicy {
    /// Immediate retries, no jitter
    pub fn new() -> Self {
        Self::default()
    }

    /// Capped exponential backoff starting at `base`
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            backoff: BackoffStrategy::Exponential { base, multiplier: 2.0, max },
            jitter: false,
        }
    }

    /// Replace the backoff strategy
    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Add up to 10% random jitter to every non-zero delay
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Current backoff strategy
    pub fn backoff(&self) -> &BackoffStrategy {
        &self.backoff
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn should_retry(&self, operation: &Operation, error: &OperationError, attempt: u32) -> RetryDecision {
        if !error.is_retryable() || operation.remaining_retries == 0 {
            return RetryDecision::give_up();
        }

        let delay = self.backoff.delay_for(attempt);
        let delay = if self.jitter && !delay.is_zero() {
            let jitter_ms = (delay.as_millis() as f64 * rand::random::<f64>() * 0.1) as u64;
            delay + Duration::from_millis(jitter_ms)
        } else {
            delay
        };

        RetryDecision::retry_after(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::types::{DocumentRef, OperationKind};
    use proptest::prelude::*;
    use serde_json::json;

    fn operation(retries: u32) -> Operation {
        Operation::new(OperationKind::Convert, DocumentRef::from_bytes("doc", vec![0u8]), json!({}))
            .with_retries(retries)
    }

    #[test]
    fn test_handler_error_with_budget_is_retried_immediately() {
        let policy = DefaultRetryPolicy::new();
        let decision = policy.should_retry(&operation(2), &OperationError::Handler("flaky".into()), 1);
        assert_eq!(decision, RetryDecision::retry_after(Duration::ZERO));
    }

    #[test]
    fn test_exhausted_budget_is_terminal() {
        let policy = DefaultRetryPolicy::new();
        let decision = policy.should_retry(&operation(0), &OperationError::Handler("flaky".into()), 3);
        assert!(!decision.retry);
    }

    #[test]
    fn test_non_handler_errors_are_never_retried() {
        let policy = DefaultRetryPolicy::new();
        let op = operation(5);
        let errors = [
            OperationError::Validation("missing id".into()),
            OperationError::DocumentUnavailable { document_id: "doc".into(), message: "gone".into() },
            OperationError::UnknownOperationKind("OCR".into()),
        ];
        for error in &errors {
            assert!(!policy.should_retry(&op, error, 1).retry, "{error} should not be retried");
        }
    }

    #[test]
    fn test_exponential_backoff_doubles_until_cap() {
        let policy = DefaultRetryPolicy::exponential(Duration::from_millis(100), Duration::from_millis(500));
        let backoff = policy.backoff();
        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(400));
        assert_eq!(backoff.delay_for(4), Duration::from_millis(500));
    }

    #[test]
    fn test_linear_backoff() {
        let backoff = BackoffStrategy::Linear {
            base: Duration::from_millis(200),
            increment: Duration::from_millis(100),
        };
        assert_eq!(backoff.delay_for(1), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let policy = DefaultRetryPolicy::new()
            .with_backoff(BackoffStrategy::Fixed(Duration::from_millis(1000)))
            .with_jitter(true);
        for _ in 0..50 {
            let decision = policy.should_retry(&operation(1), &OperationError::Handler("x".into()), 1);
            assert!(decision.delay >= Duration::from_millis(1000));
            assert!(decision.delay <= Duration::from_millis(1100));
        }
    }

    #[test]
    fn test_default_recovery_keeps_operation() {
        let policy = DefaultRetryPolicy::new();
        let op = operation(1);
        let recovered = policy.recover(&op, &OperationError::Handler("x".into())).unwrap();
        assert_eq!(recovered.id, op.id);
    }

    proptest! {
        #[test]
        fn prop_exponential_never_exceeds_cap(retry in 1u32..10_000, base_ms in 1u64..10_000) {
            let max = Duration::from_secs(30);
            let backoff = BackoffStrategy::Exponential {
                base: Duration::from_millis(base_ms),
                multiplier: 2.0,
                max,
            };
            prop_assert!(backoff.delay_for(retry) <= max);
        }
    }
}
