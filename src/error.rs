//! Fixed-shape error types produced by the engine itself (as opposed to
//! the caller's generic domain error).
//!
//! Grounded on `everruns_durable::reliability::timeout::TimeoutError` and
//! `everruns_durable::engine::executor::ExecutorError`: one variant per
//! distinct failure mode, `thiserror`-backed.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Marker carried alongside `StepTimeoutError` so that `retry_on`
/// predicates (and the `is_step_timeout_error` helper) can recognize a
/// timeout without needing to downcast the domain error type.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("step timed out after {timeout_ms}ms{}", step_name.as_deref().map(|n| format!(" (step: {n})")).unwrap_or_default())]
pub struct StepTimeoutError {
    pub timeout_ms: u64,
    pub step_name: Option<String>,
}

impl StepTimeoutError {
    pub fn new(timeout_ms: u64, step_name: Option<String>) -> Self {
        Self { timeout_ms, step_name }
    }
}

/// `true` if the given step failure is a timeout, regardless of the
/// caller's own domain error type. Intended for use as (part of) a
/// `retry_on` predicate: `RetryOptions::retry_on(|f, _| f.is_timeout())`.
pub fn is_step_timeout_error<E>(failure: &crate::result::StepFailure<E>) -> bool {
    failure.is_timeout()
}

/// `step.race` over an empty producer set fails with this rather than a
/// stringly-typed message (`spec.md` §9 Open Question, resolved in favor
/// of failure).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Error)]
#[error("step.race called with no candidate producers")]
pub struct EmptyInputError;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::StepFailure;

    #[test]
    fn timeout_error_message_includes_name() {
        let err = StepTimeoutError::new(50, Some("fetch".into()));
        assert_eq!(err.to_string(), "step timed out after 50ms (step: fetch)");
    }

    #[test]
    fn timeout_error_message_without_name() {
        let err = StepTimeoutError::new(50, None);
        assert_eq!(err.to_string(), "step timed out after 50ms");
    }

    #[test]
    fn is_step_timeout_error_helper() {
        let timeout: StepFailure<String> = StepFailure::Timeout(StepTimeoutError::new(1, None));
        let domain: StepFailure<String> = StepFailure::Domain("x".into());
        assert!(is_step_timeout_error(&timeout));
        assert!(!is_step_timeout_error(&domain));
    }
}
