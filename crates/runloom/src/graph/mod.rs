//! Typed workflow graphs: nodes, edges, and the fluent builder

mod builder;
#[allow(clippy::module_inception)]
mod graph;
mod step;

pub use builder::{ChoiceBuilder, FalsePath, Flow, GraphBuilder, GraphError, TruePath};
pub use graph::{AsyncPattern, AsyncTaskFuture, AsyncTaskHandler, Edge, Graph, StepNode};
pub use step::{
    InputProbe, OnInvocationLimit, StepConfig, StepContext, StepDefinition, StepFuture,
    StepHandler, DEFAULT_INVOCATION_LIMIT,
};
