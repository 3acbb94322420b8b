//! The tagged success/failure value and the safe-default error wrapper.
//!
//! `StepOutcome` is what a completed workflow resolves to — it always
//! resolves, never "rejects": safe-default bugs surface as
//! `Err(WorkflowError::Unexpected(..))` rather than as a language-level
//! panic reaching the caller.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tagged success/failure carrying a typed error plus an optional cause.
///
/// Exactly one variant is inhabited at a time; `cause` is never rewritten
/// once set. Produced by step operations and returned from a workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome<T, E> {
    Ok {
        value: T,
    },
    Err {
        error: E,
        #[serde(skip_serializing_if = "Option::is_none")]
        cause: Option<serde_json::Value>,
    },
}

impl<T, E> StepOutcome<T, E> {
    pub fn ok(value: T) -> Self {
        Self::Ok { value }
    }

    pub fn err(error: E) -> Self {
        Self::Err { error, cause: None }
    }

    pub fn err_with_cause(error: E, cause: serde_json::Value) -> Self {
        Self::Err {
            error,
            cause: Some(cause),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    pub fn is_err(&self) -> bool {
        matches!(self, Self::Err { .. })
    }
}

/// Which path a step's failure came from: a typed `Result` error that was
/// remapped (`step.from_result`), or a raw thrown value that was mapped to
/// a typed error (`step.try_op`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOrigin {
    Result,
    Throw,
}

/// Discriminates why a run produced an `UnexpectedError` instead of a
/// typed domain error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnexpectedCause {
    /// A panic unwound out of a step body or hook.
    UncaughtException { thrown: serde_json::Value },
    /// A typed step error leaked to the safe-default run boundary.
    StepFailure {
        origin: StepOrigin,
        error: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        thrown: Option<serde_json::Value>,
    },
    /// An async operation's future resolved to an error outside the
    /// typed step protocol (e.g. a joined task that was cancelled).
    PromiseRejected { reason: serde_json::Value },
}

/// Safe-default wrapper for any uncaught exception or boundary leak.
///
/// Produced at error boundaries; immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("unexpected error: {cause:?}")]
pub struct UnexpectedError {
    pub cause: UnexpectedCause,
}

impl UnexpectedError {
    pub fn uncaught_exception(thrown: serde_json::Value) -> Self {
        Self {
            cause: UnexpectedCause::UncaughtException { thrown },
        }
    }

    pub fn step_failure(origin: StepOrigin, error: serde_json::Value, thrown: Option<serde_json::Value>) -> Self {
        Self {
            cause: UnexpectedCause::StepFailure { origin, error, thrown },
        }
    }

    pub fn promise_rejected(reason: serde_json::Value) -> Self {
        Self {
            cause: UnexpectedCause::PromiseRejected { reason },
        }
    }
}

/// The terminal error type a [`crate::engine::WorkflowEngine`] run
/// resolves to: either the caller's own typed domain error, or the
/// safe-default [`UnexpectedError`] wrapper for bugs.
///
/// In strict mode (`WorkflowEngineOptions::strict`), every `Unexpected`
/// case is mapped through `catch_unexpected` into `Domain` before it ever
/// reaches the caller — see `spec.md` §4.7 and §7.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkflowError<E> {
    Domain(E),
    Unexpected(UnexpectedError),
}

impl<E: std::fmt::Display> std::fmt::Display for WorkflowError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Domain(e) => write!(f, "{e}"),
            Self::Unexpected(e) => write!(f, "{e}"),
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for WorkflowError<E> {}

/// A step's failure, distinguishing a domain error from a synthetic
/// timeout so that `retry_on` predicates can special-case timeouts via
/// [`crate::error::StepTimeoutError::is_step_timeout_error`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepFailure<E> {
    Domain(E),
    Timeout(crate::error::StepTimeoutError),
}

impl<E> StepFailure<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    pub fn as_domain(&self) -> Option<&E> {
        match self {
            Self::Domain(e) => Some(e),
            Self::Timeout(_) => None,
        }
    }
}

impl<E: std::fmt::Display> std::fmt::Display for StepFailure<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Domain(e) => write!(f, "{e}"),
            Self::Timeout(e) => write!(f, "{e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_ok_is_ok() {
        let outcome: StepOutcome<i32, String> = StepOutcome::ok(5);
        assert!(outcome.is_ok());
        assert!(!outcome.is_err());
    }

    #[test]
    fn outcome_err_preserves_cause() {
        let outcome: StepOutcome<i32, String> =
            StepOutcome::err_with_cause("boom".to_string(), serde_json::json!({"why": "network"}));
        match outcome {
            StepOutcome::Err { error, cause } => {
                assert_eq!(error, "boom");
                assert_eq!(cause, Some(serde_json::json!({"why": "network"})));
            }
            _ => panic!("expected Err"),
        }
    }

    #[test]
    fn workflow_error_serializes_untagged() {
        let err: WorkflowError<String> = WorkflowError::Domain("nope".to_string());
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json, serde_json::json!("nope"));
    }

    #[test]
    fn step_failure_distinguishes_timeout() {
        let timeout = StepFailure::<String>::Timeout(crate::error::StepTimeoutError {
            timeout_ms: 10,
            step_name: None,
        });
        assert!(timeout.is_timeout());
        assert!(timeout.as_domain().is_none());

        let domain = StepFailure::Domain("oops".to_string());
        assert!(!domain.is_timeout());
        assert_eq!(domain.as_domain(), Some(&"oops".to_string()));
    }
}
