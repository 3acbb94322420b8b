//! The event emitter: a single sink receiving a totally-ordered stream of
//! lifecycle events with monotonic timestamps and a stable per-run
//! identifier (`spec.md` §4.1, §6.3).
//!
//! Grounded on `everruns_durable::workflow::event::WorkflowEvent` (a
//! tagged enum of lifecycle events persisted one-at-a-time) generalized
//! to the richer event family this spec requires (steps, scopes,
//! decisions) and adapted from "persisted" to "emitted to a sink".

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::result::StepOrigin;

/// A totally-ordered, monotonically non-decreasing millisecond clock.
///
/// Wall-clock time can go backwards (NTP adjustment, VM migration); the
/// engine's ordering guarantee (`spec.md` §5: "ts is monotonically
/// non-decreasing") must hold regardless, so every tick is clamped to be
/// at least one more than the previous tick observed by this clock.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last_ms: AtomicI64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { last_ms: AtomicI64::new(0) }
    }

    /// Returns the next timestamp, guaranteed `>=` every timestamp this
    /// clock has previously returned.
    pub fn now_ms(&self) -> i64 {
        let wall = chrono::Utc::now().timestamp_millis();
        loop {
            let last = self.last_ms.load(Ordering::SeqCst);
            let candidate = if wall > last { wall } else { last + 1 };
            if self
                .last_ms
                .compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return candidate;
            }
        }
    }
}

/// Scope kind for `step.parallel` / `step.race` brackets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeType {
    Parallel,
    Race,
}

/// Terminal state of a bracketed scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeState {
    Success,
    Error,
}

/// `meta` attached to a `step_complete` event (`spec.md` §6.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCompleteMeta {
    pub origin: StepOrigin,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thrown: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_cause: Option<serde_json::Value>,
}

/// The external wire contract for visualization/persistence consumers
/// (`spec.md` §6.3). Every variant shares `workflow_id` and `ts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEventKind {
    WorkflowStart {
        name: Option<String>,
    },
    WorkflowSuccess {
        duration_ms: i64,
    },
    WorkflowError {
        error: serde_json::Value,
        duration_ms: i64,
    },
    WorkflowCancelled {
        reason: Option<String>,
        duration_ms: i64,
    },
    StepStart {
        step_id: u64,
        name: Option<String>,
        step_key: Option<String>,
        description: Option<String>,
    },
    StepSuccess {
        step_id: u64,
        name: Option<String>,
        step_key: Option<String>,
        duration_ms: i64,
    },
    StepError {
        step_id: u64,
        name: Option<String>,
        step_key: Option<String>,
        error: serde_json::Value,
        duration_ms: i64,
    },
    StepTimeout {
        step_id: u64,
        name: Option<String>,
        step_key: Option<String>,
        timeout_ms: u64,
    },
    StepRetry {
        step_id: u64,
        name: Option<String>,
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
        error: serde_json::Value,
    },
    StepRetriesExhausted {
        step_id: u64,
        name: Option<String>,
        attempts: u32,
        last_error: serde_json::Value,
    },
    StepSkipped {
        name: Option<String>,
        key: Option<String>,
        reason: Option<String>,
    },
    StepComplete {
        step_key: String,
        name: Option<String>,
        result: serde_json::Value,
        duration_ms: i64,
        meta: StepCompleteMeta,
    },
    StepCacheHit {
        step_key: String,
        name: Option<String>,
    },
    StepCacheMiss {
        step_key: String,
        name: Option<String>,
    },
    ScopeStart {
        scope_id: u64,
        scope_type: ScopeType,
        name: Option<String>,
    },
    ScopeEnd {
        scope_id: u64,
        state: ScopeState,
        duration_ms: i64,
        error: Option<serde_json::Value>,
    },
    DecisionStart {
        decision_id: String,
    },
    DecisionBranch {
        decision_id: String,
        branch_label: String,
        taken: bool,
    },
    DecisionEnd {
        decision_id: String,
        branch_taken: Option<String>,
        duration_ms: i64,
    },
}

/// A single emitted event: the shared envelope (`workflow_id`, `ts`,
/// optional `context`) plus the type-specific `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent<C = serde_json::Value> {
    pub workflow_id: Uuid,
    pub ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<C>,
    #[serde(flatten)]
    pub kind: WorkflowEventKind,
}

/// Fire-and-forget sink: exceptions/panics from the sink must not corrupt
/// engine state (`spec.md` §4.1), so callers are given a plain closure and
/// the engine is responsible for calling it defensively (see
/// [`emit`]).
pub type EventSink<C> = Arc<dyn Fn(WorkflowEvent<C>) + Send + Sync>;

/// Invoke `sink` with `event`, swallowing any panic the sink raises so
/// that a misbehaving observer can never corrupt the run it's observing.
pub fn emit<C>(sink: &Option<EventSink<C>>, event: WorkflowEvent<C>) {
    if let Some(sink) = sink {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| sink(event)));
        if let Err(panic) = result {
            tracing::warn!(?panic, "event sink panicked; event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_never_decreases() {
        let clock = MonotonicClock::new();
        let mut last = clock.now_ms();
        for _ in 0..1000 {
            let next = clock.now_ms();
            assert!(next >= last, "clock went backwards: {next} < {last}");
            last = next;
        }
    }

    #[test]
    fn emit_swallows_panicking_sink() {
        let sink: EventSink<serde_json::Value> = Arc::new(|_event| panic!("boom"));
        let event = WorkflowEvent {
            workflow_id: Uuid::now_v7(),
            ts: 0,
            context: None,
            kind: WorkflowEventKind::WorkflowStart { name: None },
        };
        // Should not panic or propagate.
        emit(&Some(sink), event);
    }

    #[test]
    fn event_serializes_with_tag() {
        let event = WorkflowEvent {
            workflow_id: Uuid::now_v7(),
            ts: 5,
            context: Some(serde_json::json!({"tenant": "acme"})),
            kind: WorkflowEventKind::StepStart {
                step_id: 1,
                name: Some("fetch".into()),
                step_key: None,
                description: None,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "step_start");
        assert_eq!(json["step_id"], 1);
    }
}
