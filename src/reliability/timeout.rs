//! Timeout harness: race a step body against a deadline (`spec.md` §4.4).
//!
//! Grounded on `other_examples/.../step_runner.rs`'s
//! `execute_with_timeout` (`tokio::select!` between the operation and a
//! sleep) and `everruns_durable::reliability::timeout::TimeoutConfig` for
//! the options shape. As in both sources, the underlying future is
//! dropped on timeout, not cancelled cooperatively — callers that spawn
//! their own cancellable work must wire that up themselves (`spec.md`
//! §4.4 Non-goal: "no cooperative cancellation of the timed-out future").

use std::future::Future;
use std::time::Duration;

use crate::error::StepTimeoutError;

/// Options controlling a timed step.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutOptions {
    pub duration: Duration,
}

impl TimeoutOptions {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    pub fn from_millis(ms: u64) -> Self {
        Self::new(Duration::from_millis(ms))
    }
}

/// Race `fut` against `options.duration`, returning `Err(StepTimeoutError)`
/// if the deadline elapses first. `fut` is dropped on timeout; it is not
/// given a chance to run to completion or clean up.
pub async fn with_timeout<F, T>(
    options: TimeoutOptions,
    step_name: Option<String>,
    fut: F,
) -> Result<T, StepTimeoutError>
where
    F: Future<Output = T>,
{
    match tokio::time::timeout(options.duration, fut).await {
        Ok(value) => Ok(value),
        Err(_) => Err(StepTimeoutError::new(options.duration.as_millis() as u64, step_name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn completes_before_deadline() {
        let result = with_timeout(TimeoutOptions::from_millis(100), None, async { 42 }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_past_deadline() {
        let options = TimeoutOptions::from_millis(10);
        let fut = async {
            tokio::time::sleep(Duration::from_millis(1000)).await;
            "never"
        };
        let result = with_timeout(options, Some("slow".into()), fut).await;
        let err = result.unwrap_err();
        assert_eq!(err.timeout_ms, 10);
        assert_eq!(err.step_name.as_deref(), Some("slow"));
    }
}
