//! # stepflow
//!
//! A typed asynchronous workflow orchestrator with deterministic event
//! emission and resumable execution.
//!
//! A workflow is a user-supplied asynchronous procedure that composes
//! finer-grained operations ("steps") through a single [`Step`] handle.
//! The engine unwraps each step's success value, short-circuits on the
//! first failure, emits a structured event stream describing execution,
//! caches keyed step results, and supports resuming a partially
//! completed run from persisted state.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowEngine                          │
//! │   (generates workflow_id, resolves resume state, runs the    │
//! │    user body, converts short-circuit into a tagged result)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!              ┌───────────────┼───────────────┐
//!              ▼               ▼               ▼
//!    ┌──────────────┐  ┌──────────────┐  ┌──────────────┐
//!    │  Step handle │  │  StepCache   │  │  EventSink    │
//!    │ (run/try/    │  │ (keyed,      │  │ (lifecycle    │
//!    │  retry/race/ │  │  resumable)  │  │  event        │
//!    │  parallel/…) │  │              │  │  stream)      │
//!    └──────────────┘  └──────────────┘  └──────────────┘
//! ```
//!
//! The visualization layer, notifier plumbing, static analysis tooling,
//! persistence serialization formats, HTTP/webhook adapters and
//! process-wide logging setup are all treated as external collaborators
//! that consume only the public contract described here.

pub mod cache;
pub mod cancellation;
pub mod decision;
pub mod engine;
pub mod error;
pub mod event;
pub mod reliability;
pub mod result;
pub mod step;

pub mod prelude {
    pub use crate::cache::{CacheEntry, CacheOutcome, InMemoryStepCache, ResumeSource, StepCache};
    pub use crate::cancellation::{CancellationHandle, CancellationSignal};
    pub use crate::decision::Decision;
    pub use crate::engine::{WorkflowBuilder, WorkflowEngine, WorkflowEngineOptions};
    pub use crate::error::{is_step_timeout_error, EmptyInputError, StepTimeoutError};
    pub use crate::event::{EventSink, WorkflowEvent};
    pub use crate::reliability::retry::{Backoff, RetryOptions};
    pub use crate::reliability::timeout::TimeoutOptions;
    pub use crate::result::{StepFailure, StepOrigin, StepOutcome, UnexpectedCause, UnexpectedError, WorkflowError};
    pub use crate::step::{Step, StepOptions};
}

pub use prelude::*;
