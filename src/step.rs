//! The step handle: the single entry point a workflow body uses to run,
//! retry, time-bound, fan out, skip, or branch on sub-operations
//! (`spec.md` §4.5, §4.6).
//!
//! Grounded primarily on `other_examples/.../step_runner.rs`'s fluent
//! `StepRunner` (start/execute/complete/fail lifecycle around a single
//! operation), combined with `everruns_durable::reliability::retry` for
//! the retry loop shape and `everruns_durable::worker::pool`'s use of
//! `tokio::task::JoinSet` for bounded concurrent fan-out
//! (`parallel`/`race`).
//!
//! Every primitive funnels through [`Step::execute`], the "common
//! pre/post protocol for keyed lazy steps": cache lookup, `step_start`,
//! panic-isolated execution (optionally retried), success/error event,
//! cache write, and, for keyed steps that were not a cache hit,
//! `on_after_step`.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::cache::{CacheEntry, CacheMeta, CacheOutcome, StepCache};
use crate::cancellation::CancellationSignal;
use crate::decision::Decision;
use crate::error::EmptyInputError;
use crate::event::{self, EventSink, MonotonicClock, ScopeState, ScopeType, StepCompleteMeta, WorkflowEvent, WorkflowEventKind};
use crate::reliability::retry::{delay_for_attempt, RetryOptions};
use crate::reliability::timeout::{with_timeout, TimeoutOptions};
use crate::result::{StepFailure, StepOrigin, UnexpectedError, WorkflowError};

/// Per-step configuration shared by every primitive (`spec.md` §4.5).
///
/// `key`, when present, makes the step's result cacheable and resumable;
/// `description` surfaces on `step_start` for visualization consumers
/// but otherwise has no effect on execution.
#[derive(Debug, Clone, Default)]
pub struct StepOptions {
    pub name: Option<String>,
    pub key: Option<String>,
    pub description: Option<String>,
}

impl StepOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            key: None,
            description: None,
        }
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

pub(crate) struct StepShared<C> {
    pub workflow_id: Uuid,
    pub clock: Arc<MonotonicClock>,
    pub sink: Option<EventSink<C>>,
    pub cache: Option<Arc<dyn StepCache>>,
    pub step_counter: AtomicU64,
    pub scope_counter: AtomicU64,
    #[allow(clippy::type_complexity)]
    pub on_after_step: Option<Arc<dyn Fn(&str, &serde_json::Value) + Send + Sync>>,
    pub signal: Option<CancellationSignal>,
}

/// The handle a workflow body calls through to run sub-operations.
///
/// Cheap to clone: internally an `Arc` over the shared run state, so
/// fan-out branches (`parallel`/`race`) can each hold their own handle
/// into the same cache, sink, and counters.
pub struct Step<C, E> {
    pub(crate) shared: Arc<StepShared<C>>,
    _marker: PhantomData<fn() -> E>,
}

impl<C, E> Clone for Step<C, E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            _marker: PhantomData,
        }
    }
}

fn panic_message(join_err: tokio::task::JoinError) -> String {
    if join_err.is_panic() {
        let payload = join_err.into_panic();
        if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "step panicked with a non-string payload".to_string()
        }
    } else {
        "step task was cancelled".to_string()
    }
}

impl<C, E> Step<C, E>
where
    C: Clone + Send + Sync + 'static,
    E: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        workflow_id: Uuid,
        clock: Arc<MonotonicClock>,
        sink: Option<EventSink<C>>,
        cache: Option<Arc<dyn StepCache>>,
        on_after_step: Option<Arc<dyn Fn(&str, &serde_json::Value) + Send + Sync>>,
        signal: Option<CancellationSignal>,
    ) -> Self {
        Self {
            shared: Arc::new(StepShared {
                workflow_id,
                clock,
                sink,
                cache,
                step_counter: AtomicU64::new(0),
                scope_counter: AtomicU64::new(0),
                on_after_step,
                signal,
            }),
            _marker: PhantomData,
        }
    }

    /// `true` once a cancellation signal has been observed — callers of
    /// [`Step::execute`]/`parallel`/`race` use this to refuse to start new
    /// work (`spec.md` §5: "no new steps start after cancellation is
    /// observed").
    fn is_cancelled(&self) -> bool {
        self.shared.signal.as_ref().map(|s| s.is_cancelled()).unwrap_or(false)
    }

    fn cancelled_error() -> WorkflowError<E> {
        WorkflowError::Unexpected(UnexpectedError::promise_rejected(serde_json::json!(
            "cancellation signal observed; no new steps start"
        )))
    }

    fn emit(&self, context: Option<C>, kind: WorkflowEventKind) {
        event::emit(
            &self.shared.sink,
            WorkflowEvent {
                workflow_id: self.shared.workflow_id,
                ts: self.shared.clock.now_ms(),
                context,
                kind,
            },
        );
    }

    /// Open a new decision-tracking scope (`spec.md` §4.6).
    pub fn decide(&self, context: Option<C>) -> Decision<C> {
        Decision::start(self.shared.workflow_id, self.shared.clock.clone(), self.shared.sink.clone(), context)
    }

    /// Run an infallible step: `f`'s output becomes the step's success
    /// value directly, with no typed failure path.
    pub async fn run<T, F, Fut>(&self, options: StepOptions, f: F) -> Result<T, WorkflowError<E>>
    where
        T: Serialize + DeserializeOwned + Clone + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut slot = Some(f);
        self.execute(options, StepOrigin::Result, None, move || {
            let f = slot.take().expect("Step::run body is invoked at most once");
            let fut = f();
            async move { Ok(fut.await) }
        })
        .await
    }

    /// Run a step whose body already returns a native `Result<T, E>`
    /// (`spec.md` §4.5: `step.from_result`).
    pub async fn from_result<T, F, Fut>(&self, options: StepOptions, f: F) -> Result<T, WorkflowError<E>>
    where
        T: Serialize + DeserializeOwned + Clone + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let mut slot = Some(f);
        self.execute(options, StepOrigin::Result, None, move || {
            let f = slot.take().expect("Step::from_result body is invoked at most once");
            let fut = f();
            async move { fut.await.map_err(StepFailure::Domain) }
        })
        .await
    }

    /// Run a step whose body's failure mode is conceptually a caught
    /// exception rather than a typed `Result` (`spec.md` §4.5:
    /// `step.try_op`). Behaves like [`Step::from_result`] but tags the
    /// resulting event/cache metadata with [`StepOrigin::Throw`] so
    /// consumers can distinguish the two origins.
    pub async fn try_op<T, F, Fut>(&self, options: StepOptions, f: F) -> Result<T, WorkflowError<E>>
    where
        T: Serialize + DeserializeOwned + Clone + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let mut slot = Some(f);
        self.execute(options, StepOrigin::Throw, None, move || {
            let f = slot.take().expect("Step::try_op body is invoked at most once");
            let fut = f();
            async move { fut.await.map_err(StepFailure::Domain) }
        })
        .await
    }

    /// Run a step bounded by a deadline (`spec.md` §4.4). The underlying
    /// future is dropped, not cancelled, if the deadline elapses.
    pub async fn with_timeout<T, F, Fut>(&self, options: StepOptions, timeout: TimeoutOptions, f: F) -> Result<T, WorkflowError<E>>
    where
        T: Serialize + DeserializeOwned + Clone + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.run_resilient(options, Some(timeout), None, f).await
    }

    /// Run a step with retry-with-backoff semantics (`spec.md` §4.3).
    pub async fn retry<T, F, Fut>(&self, options: StepOptions, retry_opts: RetryOptions<E>, f: F) -> Result<T, WorkflowError<E>>
    where
        T: Serialize + DeserializeOwned + Clone + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.run_resilient(options, None, Some(retry_opts), f).await
    }

    /// Compose a timeout and a retry policy around the same operation
    /// (`spec.md` §8 S4): each attempt races against `timeout`, and a
    /// timed-out attempt is itself a candidate for `retry_opts`'s
    /// `retry_on` predicate (see [`crate::error::is_step_timeout_error`]).
    pub async fn run_resilient<T, F, Fut>(
        &self,
        options: StepOptions,
        timeout: Option<TimeoutOptions>,
        retry_opts: Option<RetryOptions<E>>,
        f: F,
    ) -> Result<T, WorkflowError<E>>
    where
        T: Serialize + DeserializeOwned + Clone + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let step_name = options.name.clone();
        let f = Arc::new(f);
        self.execute(options, StepOrigin::Result, retry_opts, move || {
            let f = f.clone();
            let step_name = step_name.clone();
            let fut = (f)();
            async move {
                match timeout {
                    Some(t) => match with_timeout(t, step_name, fut).await {
                        Ok(result) => result.map_err(StepFailure::Domain),
                        Err(timeout_err) => Err(StepFailure::Timeout(timeout_err)),
                    },
                    None => fut.await.map_err(StepFailure::Domain),
                }
            }
        })
        .await
    }

    /// Skip `f` entirely when `condition` is `false`, emitting
    /// `step_skipped` instead of running it (`spec.md` §4.5).
    pub async fn maybe<T, F, Fut>(&self, options: StepOptions, condition: bool, f: F) -> Result<Option<T>, WorkflowError<E>>
    where
        T: Serialize + DeserializeOwned + Clone + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        if !condition {
            self.emit(
                None,
                WorkflowEventKind::StepSkipped {
                    name: options.name.clone(),
                    key: options.key.clone(),
                    reason: Some("condition was false".to_string()),
                },
            );
            return Ok(None);
        }
        self.from_result(options, f).await.map(Some)
    }

    /// Run every named producer concurrently, resolving to the object of
    /// unwrapped successes keyed by the same name (`spec.md` §4.5.4,
    /// §6.2: "named map of producers" → "object of unwrapped values").
    ///
    /// Fail-fast: on the first producer to report a typed error, the rest
    /// are aborted (their results, if any, are discarded) and `scope_end`
    /// is emitted immediately — the slower branches' eventual completion
    /// is never waited on (`spec.md` §4.5.4, §8 S5).
    pub async fn parallel<T, F, Fut>(&self, options: StepOptions, producers: Vec<(String, F)>) -> Result<HashMap<String, T>, WorkflowError<E>>
    where
        T: Serialize + DeserializeOwned + Clone + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        if self.is_cancelled() {
            return Err(Self::cancelled_error());
        }

        let scope_id = self.shared.scope_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.emit(
            None,
            WorkflowEventKind::ScopeStart {
                scope_id,
                scope_type: ScopeType::Parallel,
                name: options.name.clone(),
            },
        );
        let start = self.shared.clock.now_ms();

        if producers.is_empty() {
            self.emit(
                None,
                WorkflowEventKind::ScopeEnd {
                    scope_id,
                    state: ScopeState::Success,
                    duration_ms: self.shared.clock.now_ms() - start,
                    error: None,
                },
            );
            return Ok(HashMap::new());
        }

        let total = producers.len();
        let mut set: JoinSet<(String, Result<T, E>)> = JoinSet::new();
        for (key, producer) in producers {
            let fut = producer();
            set.spawn(async move { (key, fut.await) });
        }

        let mut values: HashMap<String, T> = HashMap::with_capacity(total);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((key, Ok(value))) => {
                    values.insert(key, value);
                }
                Ok((_, Err(error))) => {
                    set.abort_all();
                    self.emit(
                        None,
                        WorkflowEventKind::ScopeEnd {
                            scope_id,
                            state: ScopeState::Error,
                            duration_ms: self.shared.clock.now_ms() - start,
                            error: Some(serde_json::to_value(&error).unwrap_or(serde_json::Value::Null)),
                        },
                    );
                    return Err(WorkflowError::Domain(error));
                }
                Err(join_err) => {
                    set.abort_all();
                    let message = panic_message(join_err);
                    self.emit(
                        None,
                        WorkflowEventKind::ScopeEnd {
                            scope_id,
                            state: ScopeState::Error,
                            duration_ms: self.shared.clock.now_ms() - start,
                            error: Some(serde_json::json!({ "panic": message.clone() })),
                        },
                    );
                    return Err(WorkflowError::Unexpected(UnexpectedError::uncaught_exception(serde_json::json!(message))));
                }
            }
        }

        self.emit(
            None,
            WorkflowEventKind::ScopeEnd {
                scope_id,
                state: ScopeState::Success,
                duration_ms: self.shared.clock.now_ms() - start,
                error: None,
            },
        );
        Ok(values)
    }

    /// Resolve to whichever producer settles first, success or failure
    /// (`spec.md` §4.5: `step.race`). Fails with [`EmptyInputError`],
    /// wrapped as an unexpected error, if `producers` is empty.
    pub async fn race<T, F, Fut>(&self, options: StepOptions, producers: Vec<F>) -> Result<T, WorkflowError<E>>
    where
        T: Serialize + DeserializeOwned + Clone + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        if self.is_cancelled() {
            return Err(Self::cancelled_error());
        }

        if producers.is_empty() {
            return Err(WorkflowError::Unexpected(UnexpectedError::uncaught_exception(serde_json::json!(
                EmptyInputError.to_string()
            ))));
        }

        let scope_id = self.shared.scope_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.emit(
            None,
            WorkflowEventKind::ScopeStart {
                scope_id,
                scope_type: ScopeType::Race,
                name: options.name.clone(),
            },
        );
        let start = self.shared.clock.now_ms();

        let mut set: JoinSet<Result<T, E>> = JoinSet::new();
        for producer in producers {
            let fut = producer();
            set.spawn(fut);
        }

        let outcome = set.join_next().await.expect("non-empty producer set yields at least one result");
        set.abort_all();

        match outcome {
            Ok(Ok(value)) => {
                self.emit(
                    None,
                    WorkflowEventKind::ScopeEnd {
                        scope_id,
                        state: ScopeState::Success,
                        duration_ms: self.shared.clock.now_ms() - start,
                        error: None,
                    },
                );
                Ok(value)
            }
            Ok(Err(error)) => {
                self.emit(
                    None,
                    WorkflowEventKind::ScopeEnd {
                        scope_id,
                        state: ScopeState::Error,
                        duration_ms: self.shared.clock.now_ms() - start,
                        error: Some(serde_json::to_value(&error).unwrap_or(serde_json::Value::Null)),
                    },
                );
                Err(WorkflowError::Domain(error))
            }
            Err(join_err) => {
                let message = panic_message(join_err);
                self.emit(
                    None,
                    WorkflowEventKind::ScopeEnd {
                        scope_id,
                        state: ScopeState::Error,
                        duration_ms: self.shared.clock.now_ms() - start,
                        error: Some(serde_json::json!({ "panic": message.clone() })),
                    },
                );
                Err(WorkflowError::Unexpected(UnexpectedError::uncaught_exception(serde_json::json!(message))))
            }
        }
    }

    /// The common pre/post protocol shared by every step primitive:
    /// cache lookup, `step_start`, panic-isolated (and optionally
    /// retried) execution, success/error event, cache write, and
    /// `on_after_step` for keyed non-hit steps.
    async fn execute<T, F, Fut>(
        &self,
        options: StepOptions,
        origin: StepOrigin,
        retry_opts: Option<RetryOptions<E>>,
        mut body: F,
    ) -> Result<T, WorkflowError<E>>
    where
        T: Serialize + DeserializeOwned + Clone + Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, StepFailure<E>>> + Send + 'static,
    {
        if self.is_cancelled() {
            return Err(Self::cancelled_error());
        }

        let step_id = self.shared.step_counter.fetch_add(1, Ordering::SeqCst) + 1;

        if let (Some(key), Some(cache)) = (options.key.as_deref(), self.shared.cache.as_ref()) {
            if let Some(entry) = cache.get(key) {
                self.emit(
                    None,
                    WorkflowEventKind::StepCacheHit {
                        step_key: key.to_string(),
                        name: options.name.clone(),
                    },
                );
                let meta = StepCompleteMeta {
                    origin: entry.meta.origin.unwrap_or(origin),
                    thrown: entry.meta.thrown.clone(),
                    result_cause: entry.meta.result_cause.clone(),
                };
                self.emit(
                    None,
                    WorkflowEventKind::StepComplete {
                        step_key: key.to_string(),
                        name: options.name.clone(),
                        result: entry.value.clone(),
                        duration_ms: 0,
                        meta,
                    },
                );
                return match entry.outcome {
                    CacheOutcome::Ok => {
                        let value: T = serde_json::from_value(entry.value).map_err(|e| {
                            WorkflowError::Unexpected(UnexpectedError::uncaught_exception(serde_json::json!(e.to_string())))
                        })?;
                        Ok(value)
                    }
                    CacheOutcome::Err => {
                        let error: E = serde_json::from_value(entry.value).map_err(|e| {
                            WorkflowError::Unexpected(UnexpectedError::uncaught_exception(serde_json::json!(e.to_string())))
                        })?;
                        Err(WorkflowError::Domain(error))
                    }
                };
            }
            self.emit(
                None,
                WorkflowEventKind::StepCacheMiss {
                    step_key: key.to_string(),
                    name: options.name.clone(),
                },
            );
        }

        self.emit(
            None,
            WorkflowEventKind::StepStart {
                step_id,
                name: options.name.clone(),
                step_key: options.key.clone(),
                description: options.description.clone(),
            },
        );
        let start = self.shared.clock.now_ms();

        let mut attempt: u32 = 1;
        loop {
            let fut = body();
            let outcome = match tokio::spawn(fut).await {
                Ok(inner) => inner,
                Err(join_err) => {
                    return Err(WorkflowError::Unexpected(UnexpectedError::uncaught_exception(serde_json::json!(panic_message(
                        join_err
                    )))));
                }
            };

            match outcome {
                Ok(value) => {
                    let duration_ms = self.shared.clock.now_ms() - start;
                    self.emit(
                        None,
                        WorkflowEventKind::StepSuccess {
                            step_id,
                            name: options.name.clone(),
                            step_key: options.key.clone(),
                            duration_ms,
                        },
                    );
                    let json_value = serde_json::to_value(&value).unwrap_or(serde_json::Value::Null);
                    if let Some(key) = options.key.as_deref() {
                        if let Some(cache) = self.shared.cache.as_ref() {
                            cache.set(key, CacheEntry::ok(json_value.clone()));
                        }
                        self.emit(
                            None,
                            WorkflowEventKind::StepComplete {
                                step_key: key.to_string(),
                                name: options.name.clone(),
                                result: json_value.clone(),
                                duration_ms,
                                meta: StepCompleteMeta {
                                    origin,
                                    thrown: None,
                                    result_cause: None,
                                },
                            },
                        );
                        if let Some(hook) = self.shared.on_after_step.as_ref() {
                            hook(key, &json_value);
                        }
                    }
                    return Ok(value);
                }
                Err(failure) => {
                    let should_retry = retry_opts.as_ref().map(|r| r.should_retry(&failure, attempt)).unwrap_or(false);
                    if should_retry {
                        let r = retry_opts.as_ref().unwrap();
                        let delay = delay_for_attempt(r.backoff, r.initial_delay, attempt, r.max_delay, r.jitter);
                        tracing::debug!(step_id, attempt, delay_ms = delay.as_millis() as u64, "retrying step after failure");
                        self.emit(
                            None,
                            WorkflowEventKind::StepRetry {
                                step_id,
                                name: options.name.clone(),
                                attempt,
                                max_attempts: r.attempts,
                                delay_ms: delay.as_millis() as u64,
                                error: serde_json::to_value(failure_to_value(&failure)).unwrap_or(serde_json::Value::Null),
                            },
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    if retry_opts.is_some() {
                        self.emit(
                            None,
                            WorkflowEventKind::StepRetriesExhausted {
                                step_id,
                                name: options.name.clone(),
                                attempts: attempt,
                                last_error: serde_json::to_value(failure_to_value(&failure)).unwrap_or(serde_json::Value::Null),
                            },
                        );
                    }

                    let duration_ms = self.shared.clock.now_ms() - start;
                    let error_json = serde_json::to_value(failure_to_value(&failure)).unwrap_or(serde_json::Value::Null);
                    self.emit(
                        None,
                        WorkflowEventKind::StepError {
                            step_id,
                            name: options.name.clone(),
                            step_key: options.key.clone(),
                            error: error_json.clone(),
                            duration_ms,
                        },
                    );

                    return match failure {
                        StepFailure::Domain(error) => {
                            if let Some(key) = options.key.as_deref() {
                                if let Some(cache) = self.shared.cache.as_ref() {
                                    let json_error = serde_json::to_value(&error).unwrap_or(serde_json::Value::Null);
                                    cache.set(
                                        key,
                                        CacheEntry::err(
                                            json_error,
                                            CacheMeta {
                                                origin: Some(origin),
                                                thrown: None,
                                                result_cause: None,
                                            },
                                        ),
                                    );
                                }
                                self.emit(
                                    None,
                                    WorkflowEventKind::StepComplete {
                                        step_key: key.to_string(),
                                        name: options.name.clone(),
                                        result: error_json.clone(),
                                        duration_ms,
                                        meta: StepCompleteMeta {
                                            origin,
                                            thrown: None,
                                            result_cause: None,
                                        },
                                    },
                                );
                                if let Some(hook) = self.shared.on_after_step.as_ref() {
                                    hook(key, &error_json);
                                }
                            }
                            Err(WorkflowError::Domain(error))
                        }
                        StepFailure::Timeout(timeout_error) => Err(WorkflowError::Unexpected(UnexpectedError::step_failure(
                            origin,
                            serde_json::to_value(&timeout_error).unwrap_or(serde_json::Value::Null),
                            None,
                        ))),
                    };
                }
            }
        }
    }
}

fn failure_to_value<E: Serialize>(failure: &StepFailure<E>) -> serde_json::Value {
    match failure {
        StepFailure::Domain(e) => serde_json::to_value(e).unwrap_or(serde_json::Value::Null),
        StepFailure::Timeout(e) => serde_json::to_value(e).unwrap_or(serde_json::Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryStepCache;
    use std::sync::atomic::AtomicUsize;

    fn test_step() -> Step<(), String> {
        Step::new(Uuid::now_v7(), Arc::new(MonotonicClock::new()), None, Some(Arc::new(InMemoryStepCache::new())), None, None)
    }

    #[tokio::test]
    async fn run_returns_value() {
        let step = test_step();
        let result = step.run(StepOptions::new("double"), || async { 21 * 2 }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn from_result_propagates_domain_error() {
        let step = test_step();
        let result: Result<i32, WorkflowError<String>> =
            step.from_result(StepOptions::new("fail"), || async { Err("boom".to_string()) }).await;
        match result {
            Err(WorkflowError::Domain(e)) => assert_eq!(e, "boom"),
            other => panic!("expected domain error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn keyed_step_is_cached_across_calls() {
        let step = test_step();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let calls = calls.clone();
            let result = step
                .from_result(StepOptions::new("expensive").key("k1"), move || {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, String>(99)
                    }
                })
                .await;
            assert_eq!(result.unwrap(), 99);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panic_in_step_body_becomes_unexpected() {
        let step = test_step();
        let result: Result<i32, WorkflowError<String>> = step
            .from_result(StepOptions::new("panics"), || async {
                panic!("kaboom");
                #[allow(unreachable_code)]
                Ok(1)
            })
            .await;
        assert!(matches!(result, Err(WorkflowError::Unexpected(_))));
    }

    #[tokio::test]
    async fn parallel_returns_keyed_object() {
        let step = test_step();
        let producers: Vec<(String, Box<dyn FnOnce() -> std::pin::Pin<Box<dyn Future<Output = Result<i32, String>> + Send>> + Send>)> = vec![
            ("a".to_string(), Box::new(|| Box::pin(async { Ok::<_, String>(1) }))),
            ("b".to_string(), Box::new(|| Box::pin(async { Ok::<_, String>(2) }))),
            ("c".to_string(), Box::new(|| Box::pin(async { Ok::<_, String>(3) }))),
        ];
        let result = step.parallel(StepOptions::new("fanout"), producers).await.unwrap();
        assert_eq!(result.get("a"), Some(&1));
        assert_eq!(result.get("b"), Some(&2));
        assert_eq!(result.get("c"), Some(&3));
    }

    #[tokio::test]
    async fn parallel_with_no_producers_succeeds_empty() {
        let step = test_step();
        let producers: Vec<(String, Box<dyn FnOnce() -> std::pin::Pin<Box<dyn Future<Output = Result<i32, String>> + Send>> + Send>)> = vec![];
        let result = step.parallel(StepOptions::new("empty"), producers).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn parallel_fails_fast_on_first_error_without_waiting_for_the_rest() {
        let step = test_step();
        let producers: Vec<(String, Box<dyn FnOnce() -> std::pin::Pin<Box<dyn Future<Output = Result<i32, String>> + Send>> + Send>)> = vec![
            (
                "slow".to_string(),
                Box::new(|| {
                    Box::pin(async {
                        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                        Ok::<_, String>(1)
                    })
                }),
            ),
            ("fast_fail".to_string(), Box::new(|| Box::pin(async { Err::<i32, _>("X".to_string()) }))),
        ];
        let result = tokio::time::timeout(std::time::Duration::from_millis(200), step.parallel(StepOptions::new("fanout"), producers)).await;
        match result {
            Ok(Err(WorkflowError::Domain(e))) => assert_eq!(e, "X"),
            other => panic!("expected parallel to resolve quickly with domain error X, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn race_returns_first_settled() {
        let step = test_step();
        let producers: Vec<Box<dyn FnOnce() -> std::pin::Pin<Box<dyn Future<Output = Result<i32, String>> + Send>> + Send>> = vec![
            Box::new(|| {
                Box::pin(async {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    Ok::<_, String>(1)
                })
            }),
            Box::new(|| Box::pin(async { Ok::<_, String>(2) })),
        ];
        let result = step.race(StepOptions::new("race"), producers).await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn race_with_no_producers_fails() {
        let step = test_step();
        let producers: Vec<Box<dyn FnOnce() -> std::pin::Pin<Box<dyn Future<Output = Result<i32, String>> + Send>> + Send>> = vec![];
        let result = step.race(StepOptions::new("empty"), producers).await;
        assert!(matches!(result, Err(WorkflowError::Unexpected(_))));
    }
}
