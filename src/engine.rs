//! The workflow engine: generates the run identity, resolves resume
//! state, invokes the user's body through a bound [`Step`] handle, and
//! converts its short-circuiting `Result` into a tagged [`StepOutcome`]
//! (`spec.md` §4.7).
//!
//! Grounded on `everruns_durable::engine::executor::WorkflowExecutor` and
//! its `ExecutorConfig` for the staging shape (construct → resolve state
//! → emit start → run → emit terminal event), and on the everruns
//! workspace's stated choice of UUID v7 for time-ordered run identifiers.

use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::cache::{InMemoryStepCache, ResumeSource, StepCache};
use crate::cancellation::CancellationSignal;
use crate::event::{self, EventSink, MonotonicClock, WorkflowEvent, WorkflowEventKind};
use crate::result::{StepOutcome, UnexpectedCause, UnexpectedError, WorkflowError};
use crate::step::Step;

type ContextFactory<C> = Arc<dyn Fn() -> C + Send + Sync>;
/// Pre-flight gate: `false` behaves as a skip, same as `on_before_start`
/// (`spec.md` §4.7: both hooks are explicit boolean gates).
type ShouldRun<C> = Arc<dyn Fn(&C) -> bool + Send + Sync>;
type BeforeStartHook<C> = Arc<dyn Fn(&C) -> bool + Send + Sync>;
type AfterStepHook = Arc<dyn Fn(&str, &serde_json::Value) + Send + Sync>;
type ErrorHook<E> = Arc<dyn Fn(&WorkflowError<E>) + Send + Sync>;
type CatchUnexpected<E> = Arc<dyn Fn(UnexpectedError) -> E + Send + Sync>;

/// Options governing a [`WorkflowEngine`] run (`spec.md` §4.7, §7).
pub struct WorkflowEngineOptions<C, E> {
    pub name: Option<String>,
    pub on_event: Option<EventSink<C>>,
    pub cache: Option<Arc<dyn StepCache>>,
    pub resume_state: Option<ResumeSource>,
    pub should_run: Option<ShouldRun<C>>,
    pub on_before_start: Option<BeforeStartHook<C>>,
    pub on_after_step: Option<AfterStepHook>,
    pub on_error: Option<ErrorHook<E>>,
    /// When set, every [`WorkflowError::Unexpected`] is passed through
    /// this hook and folded into [`WorkflowError::Domain`] before the run
    /// result is returned, so callers never have to match on
    /// `Unexpected` themselves (`spec.md` §7: `strict` mode).
    pub catch_unexpected: Option<CatchUnexpected<E>>,
    pub strict: bool,
    /// Cooperative abort channel (`spec.md` §4.7, §5): once observed, the
    /// run transitions to `cancelled` and no further steps start. Does
    /// not forcibly terminate any step already in flight.
    pub signal: Option<CancellationSignal>,
}

impl<C, E> Default for WorkflowEngineOptions<C, E> {
    fn default() -> Self {
        Self {
            name: None,
            on_event: None,
            cache: None,
            resume_state: None,
            should_run: None,
            on_before_start: None,
            on_after_step: None,
            on_error: None,
            catch_unexpected: None,
            strict: false,
            signal: None,
        }
    }
}

/// Fluent construction of a [`WorkflowEngine`].
///
/// `create_context` is the one required input: every other option has a
/// workable default (no cache means a fresh [`InMemoryStepCache`] per
/// run, no sink means events are simply dropped).
pub struct WorkflowBuilder<C, E> {
    create_context: ContextFactory<C>,
    options: WorkflowEngineOptions<C, E>,
}

impl<C, E> WorkflowBuilder<C, E>
where
    C: Clone + Send + Sync + 'static,
    E: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn new<F>(create_context: F) -> Self
    where
        F: Fn() -> C + Send + Sync + 'static,
    {
        Self {
            create_context: Arc::new(create_context),
            options: WorkflowEngineOptions::default(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.options.name = Some(name.into());
        self
    }

    pub fn on_event(mut self, sink: EventSink<C>) -> Self {
        self.options.on_event = Some(sink);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn StepCache>) -> Self {
        self.options.cache = Some(cache);
        self
    }

    pub fn resume_state(mut self, resume: ResumeSource) -> Self {
        self.options.resume_state = Some(resume);
        self
    }

    pub fn should_run<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&C) -> bool + Send + Sync + 'static,
    {
        self.options.should_run = Some(Arc::new(predicate));
        self
    }

    /// `hook` returning `false` behaves as a skip, exactly like
    /// `should_run` (`spec.md` §4.7).
    pub fn on_before_start<F>(mut self, hook: F) -> Self
    where
        F: Fn(&C) -> bool + Send + Sync + 'static,
    {
        self.options.on_before_start = Some(Arc::new(hook));
        self
    }

    pub fn on_after_step<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, &serde_json::Value) + Send + Sync + 'static,
    {
        self.options.on_after_step = Some(Arc::new(hook));
        self
    }

    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&WorkflowError<E>) + Send + Sync + 'static,
    {
        self.options.on_error = Some(Arc::new(hook));
        self
    }

    pub fn catch_unexpected<F>(mut self, mapper: F) -> Self
    where
        F: Fn(UnexpectedError) -> E + Send + Sync + 'static,
    {
        self.options.catch_unexpected = Some(Arc::new(mapper));
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.options.strict = strict;
        self
    }

    pub fn signal(mut self, signal: CancellationSignal) -> Self {
        self.options.signal = Some(signal);
        self
    }

    pub fn build(self) -> WorkflowEngine<C, E> {
        WorkflowEngine {
            create_context: self.create_context,
            options: self.options,
        }
    }
}

/// A reusable, stateless template for running workflow bodies. Each call
/// to [`WorkflowEngine::run`] generates its own workflow id, context, and
/// step handle — the engine itself holds only configuration.
pub struct WorkflowEngine<C, E> {
    create_context: ContextFactory<C>,
    options: WorkflowEngineOptions<C, E>,
}

fn downcast_panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panicked with a non-string payload".to_string()
    }
}

fn panic_message(join_err: tokio::task::JoinError) -> String {
    if join_err.is_panic() {
        downcast_panic_message(join_err.into_panic())
    } else {
        "workflow task was cancelled".to_string()
    }
}

impl<C, E> WorkflowEngine<C, E>
where
    C: Clone + Send + Sync + 'static,
    E: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Run `body` to completion, returning a [`StepOutcome`] that never
    /// propagates a Rust-level panic to the caller (`spec.md` §4.7:
    /// "a workflow run always resolves").
    pub async fn run<O, F, Fut>(&self, body: F) -> StepOutcome<O, WorkflowError<E>>
    where
        O: Serialize + DeserializeOwned + Clone + Send + 'static,
        F: FnOnce(Step<C, E>, C) -> Fut + Send + 'static,
        Fut: Future<Output = Result<O, WorkflowError<E>>> + Send + 'static,
    {
        let workflow_id = Uuid::now_v7();
        tracing::debug!(%workflow_id, name = ?self.options.name, "workflow run starting");
        let clock = Arc::new(MonotonicClock::new());
        let context = (self.create_context)();

        let cache: Arc<dyn StepCache> = self.options.cache.clone().unwrap_or_else(|| Arc::new(InMemoryStepCache::new()));
        if let Some(resume) = &self.options.resume_state {
            let entries = resume.resolve().await;
            tracing::debug!(%workflow_id, resumed_steps = entries.len(), "merged resume state into cache");
            cache.seed_resume_state(entries);
        }

        self.emit(
            workflow_id,
            &clock,
            Some(context.clone()),
            WorkflowEventKind::WorkflowStart {
                name: self.options.name.clone(),
            },
        );
        let start = clock.now_ms();

        if let Some(predicate) = &self.options.should_run {
            match Self::invoke_guard(predicate, &context) {
                Ok(true) => {}
                Ok(false) => {
                    return self.finish_cancelled(workflow_id, &clock, context, clock.now_ms() - start, "should_run returned false".to_string());
                }
                Err(error) => {
                    return self.finish_error(workflow_id, &clock, context, clock.now_ms() - start, error);
                }
            }
        }

        if let Some(hook) = &self.options.on_before_start {
            match Self::invoke_guard(hook, &context) {
                Ok(true) => {}
                Ok(false) => {
                    return self.finish_cancelled(
                        workflow_id,
                        &clock,
                        context,
                        clock.now_ms() - start,
                        "on_before_start returned false".to_string(),
                    );
                }
                Err(error) => {
                    return self.finish_error(workflow_id, &clock, context, clock.now_ms() - start, error);
                }
            }
        }

        if let Some(signal) = &self.options.signal {
            if signal.is_cancelled() {
                return self.finish_cancelled(
                    workflow_id,
                    &clock,
                    context,
                    clock.now_ms() - start,
                    "cancellation signal observed before start".to_string(),
                );
            }
        }

        let step = Step::new(
            workflow_id,
            clock.clone(),
            self.options.on_event.clone(),
            Some(cache),
            self.options.on_after_step.clone(),
            self.options.signal.clone(),
        );

        let run_context = context.clone();
        let run_step = step.clone();
        let outcome = match tokio::spawn(async move { body(run_step, run_context).await }).await {
            Ok(result) => result,
            Err(join_err) => Err(WorkflowError::Unexpected(UnexpectedError::uncaught_exception(serde_json::json!(
                panic_message(join_err)
            )))),
        };

        let duration_ms = clock.now_ms() - start;
        match outcome {
            Ok(value) => {
                tracing::debug!(%workflow_id, duration_ms, "workflow run succeeded");
                self.emit(workflow_id, &clock, Some(context), WorkflowEventKind::WorkflowSuccess { duration_ms });
                StepOutcome::ok(value)
            }
            Err(error) => {
                if self.options.signal.as_ref().map(|s| s.is_cancelled()).unwrap_or(false) {
                    return self.finish_cancelled(
                        workflow_id,
                        &clock,
                        context,
                        duration_ms,
                        "cancellation signal observed during run".to_string(),
                    );
                }
                self.finish_error(workflow_id, &clock, context, duration_ms, error)
            }
        }
    }

    /// Invoke a pre-flight gate hook (`should_run`/`on_before_start`),
    /// catching a panic the way [`crate::step::Step::execute`] isolates a
    /// panicking step body, and mapping it to the same safe-default
    /// [`UnexpectedError`] a body panic produces (`spec.md` §4.7 step 5:
    /// "a hook throwing is caught").
    fn invoke_guard(hook: &Arc<dyn Fn(&C) -> bool + Send + Sync>, context: &C) -> Result<bool, WorkflowError<E>> {
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(context)))
            .map_err(|panic| WorkflowError::Unexpected(UnexpectedError::uncaught_exception(serde_json::json!(downcast_panic_message(panic)))))
    }

    fn finish_cancelled<O>(&self, workflow_id: Uuid, clock: &MonotonicClock, context: C, duration_ms: i64, reason: String) -> StepOutcome<O, WorkflowError<E>> {
        tracing::debug!(%workflow_id, duration_ms, reason, "workflow run cancelled");
        self.emit(
            workflow_id,
            clock,
            Some(context),
            WorkflowEventKind::WorkflowCancelled {
                reason: Some(reason.clone()),
                duration_ms,
            },
        );
        StepOutcome::err(WorkflowError::Unexpected(UnexpectedError {
            cause: UnexpectedCause::PromiseRejected {
                reason: serde_json::json!(reason),
            },
        }))
    }

    fn finish_error<O>(&self, workflow_id: Uuid, clock: &MonotonicClock, context: C, duration_ms: i64, error: WorkflowError<E>) -> StepOutcome<O, WorkflowError<E>> {
        let final_error = self.apply_strict_mode(error);
        if let Some(hook) = &self.options.on_error {
            hook(&final_error);
        }
        let error_json = serde_json::to_value(&final_error).unwrap_or(serde_json::Value::Null);
        tracing::warn!(%workflow_id, duration_ms, error = %error_json, "workflow run failed");
        self.emit(workflow_id, clock, Some(context), WorkflowEventKind::WorkflowError { error: error_json, duration_ms });
        StepOutcome::err(final_error)
    }

    fn apply_strict_mode(&self, error: WorkflowError<E>) -> WorkflowError<E> {
        if !self.options.strict {
            return error;
        }
        match (error, &self.options.catch_unexpected) {
            (WorkflowError::Unexpected(unexpected), Some(mapper)) => WorkflowError::Domain(mapper(unexpected)),
            (other, _) => other,
        }
    }

    fn emit(&self, workflow_id: Uuid, clock: &MonotonicClock, context: Option<C>, kind: WorkflowEventKind) {
        event::emit(
            &self.options.on_event,
            WorkflowEvent {
                workflow_id,
                ts: clock.now_ms(),
                context,
                kind,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepOptions;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Ctx;

    #[tokio::test]
    async fn happy_path_resolves_ok() {
        let engine: WorkflowEngine<Ctx, String> = WorkflowBuilder::new(|| Ctx).build();
        let outcome = engine
            .run(|step, _ctx| async move {
                let a = step.run(StepOptions::new("a"), || async { 1 }).await?;
                let b = step.run(StepOptions::new("b"), || async { 2 }).await?;
                Ok(a + b)
            })
            .await;
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn short_circuits_on_first_failure() {
        let engine: WorkflowEngine<Ctx, String> = WorkflowBuilder::new(|| Ctx).build();
        let ran_second = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran_second_clone = ran_second.clone();
        let outcome = engine
            .run(move |step, _ctx| {
                let ran_second = ran_second_clone.clone();
                async move {
                    step.from_result(StepOptions::new("fails"), || async { Err::<i32, _>("nope".to_string()) }).await?;
                    ran_second.store(true, std::sync::atomic::Ordering::SeqCst);
                    step.run(StepOptions::new("unreached"), || async { 1 }).await
                }
            })
            .await;
        assert!(outcome.is_err());
        assert!(!ran_second.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn emits_ordered_lifecycle_events() {
        let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let captured = events.clone();
        let sink: EventSink<Ctx> = Arc::new(move |event| {
            let label = match event.kind {
                WorkflowEventKind::WorkflowStart { .. } => "workflow_start",
                WorkflowEventKind::WorkflowSuccess { .. } => "workflow_success",
                WorkflowEventKind::StepStart { .. } => "step_start",
                WorkflowEventKind::StepSuccess { .. } => "step_success",
                _ => "other",
            };
            captured.lock().unwrap().push(label.to_string());
        });
        let engine: WorkflowEngine<Ctx, String> = WorkflowBuilder::new(|| Ctx).on_event(sink).build();
        let outcome = engine.run(|step, _ctx| async move { step.run(StepOptions::new("only"), || async { 1 }).await }).await;
        assert!(outcome.is_ok());
        let log = events.lock().unwrap().clone();
        assert_eq!(log, vec!["workflow_start", "step_start", "step_success", "workflow_success"]);
    }
}
