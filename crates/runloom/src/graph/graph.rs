//! Immutable workflow graph
//!
//! A graph is a set of typed step nodes joined by edges. Sequential edges
//! carry the data flow; branch edges are selected by routing markers.
//! Graphs are immutable after [`build`](super::GraphBuilder::build) and
//! shared behind `Arc` by every running instance.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::asynctask::ProgressReporter;
use crate::state::{StepFailure, StepOutput, StepResult, TypeToken, WorkflowContext};

use super::step::{InputProbe, StepConfig, StepHandler};

/// Boxed future returned by an async task handler
pub type AsyncTaskFuture = Pin<Box<dyn Future<Output = Result<StepResult, StepFailure>> + Send>>;

/// Handler executing an async step off the orchestration path
///
/// Receives the task args, a snapshot of the instance context, and a
/// progress reporter for updates and cancellation checks.
pub type AsyncTaskHandler = Arc<
    dyn Fn(HashMap<String, serde_json::Value>, WorkflowContext, ProgressReporter) -> AsyncTaskFuture
        + Send
        + Sync,
>;

/// Pattern an async handler is registered under
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncPattern {
    /// `*`: matches anything, last-resort fallback
    Any,

    /// `prefix-*`: matches ids starting with the prefix
    Prefix(String),

    /// An exact id
    Exact(String),
}

impl AsyncPattern {
    /// Parse a registration pattern
    pub fn parse(pattern: &str) -> Self {
        if pattern == "*" {
            return Self::Any;
        }
        match pattern.strip_suffix('*') {
            Some(prefix) if !prefix.is_empty() => Self::Prefix(prefix.to_string()),
            _ => Self::Exact(pattern.to_string()),
        }
    }

    /// Whether this pattern matches an id
    pub fn matches(&self, id: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Prefix(prefix) => id.starts_with(prefix),
            Self::Exact(exact) => id == exact,
        }
    }
}

/// Typed connection between two steps
#[derive(Debug, Clone, PartialEq)]
pub enum Edge {
    /// Ordinary data-flow edge
    Sequential {
        /// Source step
        from: String,
        /// Target step
        to: String,
    },

    /// Branch edge selected when the routing marker's type matches
    BranchOnType {
        /// Source step
        from: String,
        /// Target step
        to: String,
        /// Marker type selecting this edge
        marker: TypeToken,
    },

    /// Branch edge selected when both the marker's type and value match
    BranchOnValue {
        /// Source step
        from: String,
        /// Target step
        to: String,
        /// Marker type selecting this edge
        marker: TypeToken,
        /// Marker value selecting this edge
        value: serde_json::Value,
    },
}

impl Edge {
    /// Source step id
    pub fn from(&self) -> &str {
        match self {
            Self::Sequential { from, .. }
            | Self::BranchOnType { from, .. }
            | Self::BranchOnValue { from, .. } => from,
        }
    }

    /// Target step id
    pub fn to(&self) -> &str {
        match self {
            Self::Sequential { to, .. }
            | Self::BranchOnType { to, .. }
            | Self::BranchOnValue { to, .. } => to,
        }
    }

    /// Whether this is a data-flow edge
    pub fn is_sequential(&self) -> bool {
        matches!(self, Self::Sequential { .. })
    }
}

/// A step assembled into a graph
#[derive(Clone)]
pub struct StepNode {
    id: String,
    input: TypeToken,
    output: TypeToken,
    handler: StepHandler,
    probe: InputProbe,
    is_initial: bool,
    config: StepConfig,
}

impl StepNode {
    pub(crate) fn new(
        id: String,
        input: TypeToken,
        output: TypeToken,
        handler: StepHandler,
        probe: InputProbe,
        is_initial: bool,
        config: StepConfig,
    ) -> Self {
        Self {
            id,
            input,
            output,
            handler,
            probe,
            is_initial,
            config,
        }
    }

    /// The step id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Declared input type
    pub fn input(&self) -> &TypeToken {
        &self.input
    }

    /// Declared output type
    pub fn output(&self) -> &TypeToken {
        &self.output
    }

    /// Whether this is the graph's initial step
    pub fn is_initial(&self) -> bool {
        self.is_initial
    }

    /// Per-step configuration
    pub fn config(&self) -> &StepConfig {
        &self.config
    }

    /// The erased executor
    pub fn handler(&self) -> &StepHandler {
        &self.handler
    }

    /// Whether a payload of the given type is acceptable as input
    pub fn accepts(&self, token: &TypeToken) -> bool {
        self.input.accepts(token)
    }

    /// Whether the given output's serialized form decodes into this step's
    /// input type (the cast check)
    pub fn probe_input(&self, output: &StepOutput) -> bool {
        (self.probe)(output)
    }
}

impl std::fmt::Debug for StepNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepNode")
            .field("id", &self.id)
            .field("input", &self.input)
            .field("output", &self.output)
            .field("is_initial", &self.is_initial)
            .finish()
    }
}

/// Immutable directed graph of typed step nodes
pub struct Graph {
    id: String,
    version: String,
    input: TypeToken,
    output: TypeToken,
    nodes: HashMap<String, StepNode>,
    order: Vec<String>,
    edges: HashMap<String, Vec<Edge>>,
    initial: String,
    async_handlers: Vec<(AsyncPattern, AsyncTaskHandler)>,
}

impl Graph {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        version: String,
        input: TypeToken,
        output: TypeToken,
        nodes: HashMap<String, StepNode>,
        order: Vec<String>,
        edges: HashMap<String, Vec<Edge>>,
        initial: String,
        async_handlers: Vec<(AsyncPattern, AsyncTaskHandler)>,
    ) -> Self {
        Self {
            id,
            version,
            input,
            output,
            nodes,
            order,
            edges,
            initial,
            async_handlers,
        }
    }

    /// The graph id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The graph version
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Declared workflow input type
    pub fn input(&self) -> &TypeToken {
        &self.input
    }

    /// Declared workflow output type
    pub fn output(&self) -> &TypeToken {
        &self.output
    }

    /// The initial step id
    pub fn initial_step_id(&self) -> &str {
        &self.initial
    }

    /// Look up a node by id
    pub fn node(&self, step_id: &str) -> Option<&StepNode> {
        self.nodes.get(step_id)
    }

    /// All nodes in declaration order
    pub fn nodes(&self) -> impl Iterator<Item = &StepNode> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Outgoing edges of a step, in declaration order
    pub fn edges_from(&self, step_id: &str) -> &[Edge] {
        self.edges.get(step_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether a step has any outgoing sequential edge
    pub fn has_outgoing_sequential(&self, step_id: &str) -> bool {
        self.edges_from(step_id).iter().any(Edge::is_sequential)
    }

    /// Resolve the async handler for a task
    ///
    /// Lookup order: exact task id, exact step id, non-wildcard prefix
    /// patterns (most recently registered wins), then `*`.
    pub fn resolve_async_handler(
        &self,
        task_id: &str,
        step_id: &str,
    ) -> Option<&AsyncTaskHandler> {
        let exact = |wanted: &str| {
            self.async_handlers
                .iter()
                .rev()
                .find(|(p, _)| matches!(p, AsyncPattern::Exact(e) if e == wanted))
                .map(|(_, h)| h)
        };

        exact(task_id)
            .or_else(|| exact(step_id))
            .or_else(|| {
                self.async_handlers
                    .iter()
                    .rev()
                    .find(|(p, _)| matches!(p, AsyncPattern::Prefix(_)) && p.matches(task_id))
                    .map(|(_, h)| h)
            })
            .or_else(|| {
                self.async_handlers
                    .iter()
                    .rev()
                    .find(|(p, _)| matches!(p, AsyncPattern::Any))
                    .map(|(_, h)| h)
            })
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("initial", &self.initial)
            .field("steps", &self.order)
            .field("async_handlers", &self.async_handlers.len())
            .finish()
    }
}
