//! Retry controller: a pure delay function plus the options bag a
//! [`crate::step::Step`] consults when wrapping a step body in retry
//! semantics (`spec.md` §4.3).
//!
//! Grounded on `everruns_durable::reliability::retry::RetryPolicy` for the
//! options shape (attempts/backoff/max_delay/jitter) and on
//! `other_examples/.../retry.rs`'s `retry_async` loop for the actual
//! attempt/sleep/retry-on-predicate control flow, adapted to emit
//! `step_retry` / `step_retries_exhausted` events instead of logging.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::result::StepFailure;

/// Backoff shape between retry attempts (`spec.md` §4.3).
///
/// `attempt` is 1-based: the delay computed for `attempt = n` is the delay
/// *before* the n-th retry (i.e. after the n-th failure).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed,
    Linear,
    Exponential,
}

impl Backoff {
    fn base_delay(self, initial_delay: Duration, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            Backoff::Fixed => initial_delay,
            Backoff::Linear => initial_delay.saturating_mul(attempt),
            Backoff::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                initial_delay.saturating_mul(factor)
            }
        }
    }
}

/// Compute the delay before the given (1-based) retry attempt, capping at
/// `max_delay` and, if `jitter` is set, scaling by a uniform factor in
/// `[0.5, 1.5)` (`spec.md` §4.3: "jitter... must not push the delay below
/// zero or invalidate the configured cap").
pub fn delay_for_attempt(
    backoff: Backoff,
    initial_delay: Duration,
    attempt: u32,
    max_delay: Option<Duration>,
    jitter: bool,
) -> Duration {
    let mut delay = backoff.base_delay(initial_delay, attempt);
    if let Some(cap) = max_delay {
        delay = delay.min(cap);
    }
    if jitter {
        let factor = rand::thread_rng().gen_range(0.5..1.5);
        let scaled_ms = (delay.as_secs_f64() * factor).max(0.0);
        delay = Duration::from_secs_f64(scaled_ms);
        if let Some(cap) = max_delay {
            delay = delay.min(cap);
        }
    }
    delay
}

/// Predicate deciding whether a given failure on a given (1-based) attempt
/// should be retried. Defaults to "retry everything".
pub type RetryPredicate<E> = Arc<dyn Fn(&StepFailure<E>, u32) -> bool + Send + Sync>;

/// Options controlling a retried step (`spec.md` §4.3).
#[derive(Clone)]
pub struct RetryOptions<E> {
    /// Maximum number of attempts, including the first. Must be `>= 1`.
    pub attempts: u32,
    pub backoff: Backoff,
    pub initial_delay: Duration,
    pub max_delay: Option<Duration>,
    pub jitter: bool,
    pub retry_on: Option<RetryPredicate<E>>,
}

impl<E> std::fmt::Debug for RetryOptions<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryOptions")
            .field("attempts", &self.attempts)
            .field("backoff", &self.backoff)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .field("retry_on", &self.retry_on.as_ref().map(|_| "Fn(..)"))
            .finish()
    }
}

impl<E> Default for RetryOptions<E> {
    fn default() -> Self {
        Self {
            attempts: 1,
            backoff: Backoff::Fixed,
            initial_delay: Duration::from_millis(0),
            max_delay: None,
            jitter: false,
            retry_on: None,
        }
    }
}

impl<E> RetryOptions<E> {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            ..Self::default()
        }
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    pub fn retry_on<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&StepFailure<E>, u32) -> bool + Send + Sync + 'static,
    {
        self.retry_on = Some(Arc::new(predicate));
        self
    }

    /// Whether a failure on the given (1-based) attempt should be retried,
    /// factoring in both the predicate and whether attempts remain.
    pub fn should_retry(&self, failure: &StepFailure<E>, attempt: u32) -> bool {
        if attempt >= self.attempts {
            return false;
        }
        match &self.retry_on {
            Some(predicate) => predicate(failure, attempt),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_backoff_is_constant() {
        let d = Duration::from_millis(100);
        assert_eq!(delay_for_attempt(Backoff::Fixed, d, 1, None, false), d);
        assert_eq!(delay_for_attempt(Backoff::Fixed, d, 5, None, false), d);
    }

    #[test]
    fn linear_backoff_scales_with_attempt() {
        let d = Duration::from_millis(100);
        assert_eq!(delay_for_attempt(Backoff::Linear, d, 1, None, false), Duration::from_millis(100));
        assert_eq!(delay_for_attempt(Backoff::Linear, d, 3, None, false), Duration::from_millis(300));
    }

    #[test]
    fn exponential_backoff_doubles() {
        let d = Duration::from_millis(100);
        assert_eq!(delay_for_attempt(Backoff::Exponential, d, 1, None, false), Duration::from_millis(100));
        assert_eq!(delay_for_attempt(Backoff::Exponential, d, 2, None, false), Duration::from_millis(200));
        assert_eq!(delay_for_attempt(Backoff::Exponential, d, 4, None, false), Duration::from_millis(800));
    }

    #[test]
    fn max_delay_caps_the_result() {
        let d = Duration::from_millis(100);
        let capped = delay_for_attempt(Backoff::Exponential, d, 10, Some(Duration::from_millis(500)), false);
        assert_eq!(capped, Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_within_cap() {
        let d = Duration::from_millis(100);
        for _ in 0..200 {
            let delay = delay_for_attempt(Backoff::Fixed, d, 1, Some(Duration::from_millis(120)), true);
            assert!(delay <= Duration::from_millis(120));
        }
    }

    #[test]
    fn should_retry_respects_attempts_budget() {
        let opts: RetryOptions<String> = RetryOptions::new(3);
        let failure = StepFailure::Domain("boom".to_string());
        assert!(opts.should_retry(&failure, 1));
        assert!(opts.should_retry(&failure, 2));
        assert!(!opts.should_retry(&failure, 3));
    }

    #[test]
    fn should_retry_honors_predicate() {
        let opts: RetryOptions<String> = RetryOptions::new(5).retry_on(|f, _| !f.is_timeout());
        let timeout = StepFailure::Timeout(crate::error::StepTimeoutError::new(1, None));
        assert!(!opts.should_retry(&timeout, 1));
    }
}
