//! Cooperative cancellation (`spec.md` §4.7, §5): a best-effort abort
//! signal. Setting it transitions a run towards `cancelled`, but never
//! forcibly aborts an in-flight operation — only new steps are blocked
//! from starting once it is observed.
//!
//! Grounded on `everruns_durable::activity::context::{ActivityContext,
//! CancellationHandle}`, which pairs an `Arc<AtomicBool>` flag with a
//! cloneable handle the caller can hold independently of the context
//! that reads it; generalized here from a single activity attempt to an
//! entire workflow run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Read side: threaded through the engine and every step it runs.
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal {
    cancelled: Arc<AtomicBool>,
}

impl CancellationSignal {
    /// Create a signal together with the handle used to trip it.
    pub fn new() -> (Self, CancellationHandle) {
        let cancelled = Arc::new(AtomicBool::new(false));
        (
            Self { cancelled: cancelled.clone() },
            CancellationHandle { cancelled },
        )
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Write side, handed to whoever should be able to abort the run.
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancellationHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_observed_through_the_signal() {
        let (signal, handle) = CancellationSignal::new();
        assert!(!signal.is_cancelled());
        handle.cancel();
        assert!(signal.is_cancelled());
    }

    #[test]
    fn signal_clones_share_state() {
        let (signal, handle) = CancellationSignal::new();
        let other = signal.clone();
        handle.cancel();
        assert!(other.is_cancelled());
    }
}
