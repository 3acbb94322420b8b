//! Decision tracking: in-band emission of branch-taken events so an
//! external consumer can reconstruct which path a workflow took without
//! re-running it (`spec.md` §4.6).
//!
//! No teacher module tracks conditional branches as first-class events;
//! this generalizes the event-sourcing idiom already used for steps in
//! `everruns_durable::workflow::event::WorkflowEvent` to decisions, using
//! `decision_id` as the sole correlation key so nested or sibling
//! decisions never need a call stack to pair `decision_start` with
//! `decision_end` (`spec.md` §4.6: "decisionId is the only thing that
//! associates a decision_end with its decision_start").

use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::event::{self, EventSink, MonotonicClock, WorkflowEvent, WorkflowEventKind};

/// A single tracked decision point. Created via
/// [`crate::step::Step::decide`], `Decision` emits `decision_start` on
/// construction, `decision_branch` each time [`Decision::branch`] is
/// called, and `decision_end` exactly once, on [`Decision::end`] or on
/// drop if the caller never called it explicitly.
pub struct Decision<C> {
    decision_id: String,
    workflow_id: Uuid,
    clock: Arc<MonotonicClock>,
    sink: Option<EventSink<C>>,
    started_ms: i64,
    ended: Mutex<bool>,
}

impl<C: Clone> Decision<C> {
    pub(crate) fn start(workflow_id: Uuid, clock: Arc<MonotonicClock>, sink: Option<EventSink<C>>, context: Option<C>) -> Self {
        let decision_id = Uuid::now_v7().to_string();
        let started_ms = clock.now_ms();
        event::emit(
            &sink,
            WorkflowEvent {
                workflow_id,
                ts: started_ms,
                context,
                kind: WorkflowEventKind::DecisionStart {
                    decision_id: decision_id.clone(),
                },
            },
        );
        Self {
            decision_id,
            workflow_id,
            clock,
            sink,
            started_ms,
            ended: Mutex::new(false),
        }
    }

    pub fn decision_id(&self) -> &str {
        &self.decision_id
    }

    /// Record that `label` was (or was not) the path taken at this
    /// decision point. Safe to call multiple times, e.g. once per
    /// candidate arm of a `match`-backed `step.track_switch`.
    pub fn branch(&self, label: impl Into<String>, taken: bool, context: Option<C>) {
        event::emit(
            &self.sink,
            WorkflowEvent {
                workflow_id: self.workflow_id,
                ts: self.clock.now_ms(),
                context,
                kind: WorkflowEventKind::DecisionBranch {
                    decision_id: self.decision_id.clone(),
                    branch_label: label.into(),
                    taken,
                },
            },
        );
    }

    /// Close the decision, recording which branch (if any) was ultimately
    /// taken. Idempotent: only the first call emits `decision_end`.
    pub fn end(&self, branch_taken: Option<String>, context: Option<C>) {
        let mut ended = self.ended.lock();
        if *ended {
            return;
        }
        *ended = true;
        let now = self.clock.now_ms();
        event::emit(
            &self.sink,
            WorkflowEvent {
                workflow_id: self.workflow_id,
                ts: now,
                context,
                kind: WorkflowEventKind::DecisionEnd {
                    decision_id: self.decision_id.clone(),
                    branch_taken,
                    duration_ms: now - self.started_ms,
                },
            },
        );
    }
}

impl<C> Drop for Decision<C> {
    fn drop(&mut self) {
        let mut ended = self.ended.lock();
        if *ended {
            return;
        }
        *ended = true;
        let now = self.clock.now_ms();
        event::emit(
            &self.sink,
            WorkflowEvent {
                workflow_id: self.workflow_id,
                ts: now,
                context: None,
                kind: WorkflowEventKind::DecisionEnd {
                    decision_id: self.decision_id.clone(),
                    branch_taken: None,
                    duration_ms: now - self.started_ms,
                },
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn branch_and_end_emit_in_order() {
        let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = events.clone();
        let sink: EventSink<()> = Arc::new(move |event| {
            let label = match event.kind {
                WorkflowEventKind::DecisionStart { .. } => "start",
                WorkflowEventKind::DecisionBranch { .. } => "branch",
                WorkflowEventKind::DecisionEnd { .. } => "end",
                _ => "other",
            };
            captured.lock().push(label.to_string());
        });
        let decision = Decision::start(Uuid::now_v7(), Arc::new(MonotonicClock::new()), Some(sink), None);
        decision.branch("true_branch", true, None);
        decision.end(Some("true_branch".into()), None);
        assert_eq!(*events.lock(), vec!["start", "branch", "end"]);
    }

    #[test]
    fn end_is_idempotent() {
        let count = Arc::new(AtomicUsize::new(0));
        let captured = count.clone();
        let sink: EventSink<()> = Arc::new(move |event| {
            if matches!(event.kind, WorkflowEventKind::DecisionEnd { .. }) {
                captured.fetch_add(1, Ordering::SeqCst);
            }
        });
        let decision = Decision::start(Uuid::now_v7(), Arc::new(MonotonicClock::new()), Some(sink), None);
        decision.end(None, None);
        decision.end(None, None);
        drop(decision);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
