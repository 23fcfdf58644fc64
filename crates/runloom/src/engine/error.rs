//! Engine-level error type

use crate::graph::GraphError;
use crate::persistence::StoreError;
use crate::state::{ErrorInfo, StateError};
use crate::worker::WorkerPoolError;

/// Errors surfaced by engine operations and completed executions
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed input to an engine operation
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A graph with this id is already registered
    #[error("workflow already registered: {0}")]
    DuplicateWorkflow(String),

    /// No graph registered under this id
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    /// No instance stored under this id
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// Operation not legal in the instance's current state
    #[error("state violation: {0}")]
    StateViolation(String),

    /// Input type not acceptable where it was offered
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// No legal routing target
    #[error("routing failure: {0}")]
    RoutingFailure(String),

    /// The workflow failed; the record carries kind, message, and step
    #[error("workflow failed: {0}")]
    WorkflowFailed(ErrorInfo),

    /// Graph validation failure
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Repository failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Payload encoding failure
    #[error(transparent)]
    State(#[from] StateError),

    /// Worker pool failure
    #[error(transparent)]
    Pool(#[from] WorkerPoolError),

    /// The execution handle was superseded (e.g. by a resume) or the
    /// engine dropped before completion
    #[error("execution detached before completion")]
    Detached,
}
