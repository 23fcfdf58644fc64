//! # Runloom
//!
//! A durable workflow orchestration engine executing typed, multi-step
//! graphs with explicit control outcomes.
//!
//! ## Features
//!
//! - **Typed step routing**: steps exchange type-tagged payloads; edges and
//!   routing decisions are driven by type identity
//! - **Durable suspend/resume**: instances pause for human input with a
//!   type-checked resumption protocol and survive process restarts
//! - **Async task lifecycle**: handlers run off the orchestration path with
//!   progress reporting and cooperative cancellation
//! - **Automatic retries**: per-step policies with exponential backoff,
//!   jitter, and conditional retry/abort predicates
//! - **Circuit breakers**: per-step closed/open/half-open admission control
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkflowEngine                         │
//! │   (registers graphs, creates/resumes instances, queries)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Orchestrator                          │
//! │  (main loop: route, suspend, branch, finish, fail, async)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │            RetryExecutor → StepExecutor → handler            │
//! │     (breaker gate, invocation limits, backoff, history)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │    StateRepository · SuspensionData · AsyncStepState         │
//! │        (snapshots persisted after every transition)          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use runloom::prelude::*;
//!
//! # tokio_test::block_on(async {
//! let engine = WorkflowEngine::new();
//! engine
//!     .register(
//!         GraphBuilder::new("math", "1.0")
//!             .start_with(StepDefinition::value("double", |n: i64, _ctx| async move {
//!                 Ok(n * 2)
//!             }))
//!             .then(StepDefinition::value("add-ten", |n: i64, _ctx| async move {
//!                 Ok(n + 10)
//!             }))
//!             .then(StepDefinition::of("format", |n: i64, _ctx| async move {
//!                 StepResult::finish(n.to_string()).map_err(Into::into)
//!             }))
//!             .build()
//!             .unwrap(),
//!     )
//!     .unwrap();
//!
//! let execution = engine.execute::<i64, String>("math", 2).await.unwrap();
//! assert_eq!(execution.result().await.unwrap(), "14");
//! # });
//! ```

pub mod asynctask;
pub mod engine;
pub mod execution;
pub mod graph;
pub mod orchestrator;
pub mod persistence;
pub mod reliability;
pub mod routing;
pub mod schema;
pub mod state;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::asynctask::{ProgressReporter, ProgressTracker};
    pub use crate::engine::{
        EngineConfig, EngineError, Execution, ProgressSnapshot, WorkflowEngine, WorkflowListener,
    };
    pub use crate::execution::{RetryListener, StepInterceptor};
    pub use crate::graph::{
        Flow, GraphBuilder, GraphError, OnInvocationLimit, StepContext, StepDefinition,
    };
    pub use crate::persistence::{
        AsyncStepState, AsyncStepStateRepository, AsyncStepStatus, StateRepository, StoreError,
        SuspensionData, SuspensionDataRepository,
    };
    pub use crate::reliability::{CircuitBreakerConfig, CircuitState, RetryPolicy};
    pub use crate::state::{
        ErrorInfo, ErrorKind, StepFailure, StepOutput, StepResult, TypeToken, WorkflowContext,
        WorkflowInstance, WorkflowStatus,
    };
}

// Re-export key types at crate root
pub use engine::{EngineError, Execution, WorkflowEngine};
pub use graph::{Graph, GraphBuilder, StepDefinition};
pub use reliability::{CircuitBreakerConfig, RetryPolicy};
pub use state::{StepFailure, StepOutput, StepResult, WorkflowInstance, WorkflowStatus};
