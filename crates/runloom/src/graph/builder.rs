//! Fluent graph assembly
//!
//! The builder chains step definitions into a validated [`Graph`]:
//! sequential chains via [`then`](GraphBuilder::then), two-way branches via
//! [`branch`](GraphBuilder::branch), value dispatch via
//! [`choose`](GraphBuilder::choose), fan-out/join via
//! [`parallel`](GraphBuilder::parallel), and async handler registration via
//! [`with_async_handler`](GraphBuilder::with_async_handler).

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::asynctask::ProgressReporter;
use crate::state::{StepFailure, StepResult, TypeToken, WorkflowContext};

use super::graph::{AsyncPattern, AsyncTaskHandler, Edge, Graph, StepNode};
use super::step::{StepDefinition, StepFuture, StepHandler};

/// Routing marker for the true arm of a [`GraphBuilder::branch`]
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TruePath;

/// Routing marker for the false arm of a [`GraphBuilder::branch`]
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FalsePath;

/// Error type for graph assembly
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum GraphError {
    /// No initial step was declared
    #[error("graph '{0}' has no initial step")]
    MissingInitialStep(String),

    /// A step id was declared twice
    #[error("duplicate step id: {0}")]
    DuplicateStep(String),

    /// An edge references an unknown step
    #[error("edge references unknown step: {0}")]
    UnknownStep(String),

    /// A step cannot be reached from the initial step
    #[error("step '{0}' is unreachable from the initial step")]
    UnreachableStep(String),

    /// A builder call was malformed
    #[error("invalid graph definition: {0}")]
    InvalidDefinition(String),
}

/// A reusable linear sub-sequence used by branch arms
///
/// # Example
///
/// ```
/// use runloom::graph::{Flow, StepDefinition};
/// use runloom::state::StepResult;
///
/// let flow = Flow::start(StepDefinition::of("done", |s: String, _ctx| async move {
///     StepResult::finish(s).map_err(Into::into)
/// }));
/// ```
#[derive(Debug)]
pub struct Flow {
    defs: Vec<StepDefinition>,
}

impl Flow {
    /// Start a flow with its first step
    pub fn start(def: StepDefinition) -> Self {
        Self { defs: vec![def] }
    }

    /// Append a step, joined sequentially to the previous one
    pub fn then(mut self, def: StepDefinition) -> Self {
        self.defs.push(def);
        self
    }

    fn first_id(&self) -> Option<String> {
        self.defs.first().map(|d| d.id().to_string())
    }
}

/// Fluent assembler producing a validated [`Graph`]
///
/// # Example
///
/// ```
/// use runloom::graph::{GraphBuilder, StepDefinition};
/// use runloom::state::StepResult;
///
/// let graph = GraphBuilder::new("math", "1.0")
///     .start_with(StepDefinition::value("double", |n: i64, _ctx| async move { Ok(n * 2) }))
///     .then(StepDefinition::of("format", |n: i64, _ctx| async move {
///         StepResult::finish(n.to_string()).map_err(Into::into)
///     }))
///     .build()
///     .unwrap();
///
/// assert_eq!(graph.initial_step_id(), "double");
/// ```
pub struct GraphBuilder {
    id: String,
    version: String,
    output: TypeToken,
    defs: Vec<StepDefinition>,
    edges: Vec<Edge>,
    initial: Option<String>,
    current: Option<String>,
    async_handlers: Vec<(AsyncPattern, AsyncTaskHandler)>,
    error: Option<GraphError>,
}

impl GraphBuilder {
    /// Start building a graph
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            output: TypeToken::value(),
            defs: Vec::new(),
            edges: Vec::new(),
            initial: None,
            current: None,
            async_handlers: Vec::new(),
            error: None,
        }
    }

    fn record_error(&mut self, error: GraphError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    fn add_flow(&mut self, flow: Flow) {
        let mut prev: Option<String> = None;
        for def in flow.defs {
            if let Some(prev_id) = prev {
                self.edges.push(Edge::Sequential {
                    from: prev_id,
                    to: def.id().to_string(),
                });
            }
            prev = Some(def.id().to_string());
            self.defs.push(def);
        }
    }

    /// Declare the initial step
    pub fn start_with(mut self, def: StepDefinition) -> Self {
        if self.initial.is_some() {
            self.record_error(GraphError::InvalidDefinition(
                "start_with() called twice".to_string(),
            ));
            return self;
        }
        self.initial = Some(def.id().to_string());
        self.current = Some(def.id().to_string());
        self.defs.push(def);
        self
    }

    /// Append a step, joined sequentially to the chain tail
    pub fn then(mut self, def: StepDefinition) -> Self {
        match self.current.clone() {
            Some(current) => {
                self.edges.push(Edge::Sequential {
                    from: current,
                    to: def.id().to_string(),
                });
                self.current = Some(def.id().to_string());
                self.defs.push(def);
            }
            None => self.record_error(GraphError::InvalidDefinition(format!(
                "then('{}') has no preceding step to chain from",
                def.id()
            ))),
        }
        self
    }

    /// Fan out to several steps and rejoin through a synthetic join node
    ///
    /// The join node forwards whatever value reaches it.
    pub fn parallel(mut self, steps: Vec<StepDefinition>) -> Self {
        let current = match self.current.clone() {
            Some(c) => c,
            None => {
                self.record_error(GraphError::InvalidDefinition(
                    "parallel() has no preceding step to fan out from".to_string(),
                ));
                return self;
            }
        };
        if steps.is_empty() {
            self.record_error(GraphError::InvalidDefinition(
                "parallel() requires at least one step".to_string(),
            ));
            return self;
        }

        let join_id = format!("{current}-join");
        for def in steps {
            self.edges.push(Edge::Sequential {
                from: current.clone(),
                to: def.id().to_string(),
            });
            self.edges.push(Edge::Sequential {
                from: def.id().to_string(),
                to: join_id.clone(),
            });
            self.defs.push(def);
        }

        let forward: StepHandler = Arc::new(|input, ctx| {
            Box::pin(async move {
                match input {
                    Some(data) => Ok(StepResult::Continue { data }),
                    None => Err(StepFailure::new(format!(
                        "join step '{}' received no value",
                        ctx.step_id()
                    ))),
                }
            }) as StepFuture
        });
        let join = StepDefinition::raw(
            join_id.clone(),
            TypeToken::value(),
            TypeToken::value(),
            forward,
            Arc::new(|_| true),
        );
        self.defs.push(join);
        self.current = Some(join_id);
        self
    }

    /// Two-way branch on a typed predicate
    ///
    /// Emits a decision node returning a routing marker and a branch edge
    /// per arm. Arms terminate on their own; the chain ends here.
    pub fn branch<I, P>(
        mut self,
        id: impl Into<String>,
        predicate: P,
        true_flow: Flow,
        false_flow: Flow,
    ) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        P: Fn(&I) -> bool + Send + Sync + 'static,
    {
        let id = id.into();
        let decision = StepDefinition::of::<I, _, _>(id.clone(), move |input: I, _ctx| {
            let taken = predicate(&input);
            async move {
                let result = if taken {
                    StepResult::branch(&TruePath)
                } else {
                    StepResult::branch(&FalsePath)
                };
                result.map_err(Into::into)
            }
        });
        self = self.then(decision);

        match (true_flow.first_id(), false_flow.first_id()) {
            (Some(true_first), Some(false_first)) => {
                self.edges.push(Edge::BranchOnType {
                    from: id.clone(),
                    to: true_first,
                    marker: TypeToken::of::<TruePath>(),
                });
                self.edges.push(Edge::BranchOnType {
                    from: id,
                    to: false_first,
                    marker: TypeToken::of::<FalsePath>(),
                });
                self.add_flow(true_flow);
                self.add_flow(false_flow);
            }
            _ => self.record_error(GraphError::InvalidDefinition(format!(
                "branch '{id}' requires non-empty flows"
            ))),
        }
        self.current = None;
        self
    }

    /// Value dispatch: route on the selector's result
    ///
    /// Each [`when`](ChoiceBuilder::when) arm gets a value edge; the
    /// [`otherwise`](ChoiceBuilder::otherwise) arm catches everything else.
    pub fn choose<I, V, S>(mut self, id: impl Into<String>, selector: S) -> ChoiceBuilder<V>
    where
        I: DeserializeOwned + Send + 'static,
        V: Serialize + Send + Sync + 'static,
        S: Fn(&I) -> V + Send + Sync + 'static,
    {
        let id = id.into();
        let decision = StepDefinition::of::<I, _, _>(id.clone(), move |input: I, _ctx| {
            let value = selector(&input);
            async move { StepResult::branch_on_value(&value).map_err(Into::into) }
        });
        self = self.then(decision);

        ChoiceBuilder {
            builder: self,
            decision_id: id,
            marker: TypeToken::of::<V>(),
            _value: PhantomData,
        }
    }

    /// Register an async handler under a pattern (`*`, `prefix-*`, exact id)
    pub fn with_async_handler<F, Fut>(mut self, pattern: &str, handler: F) -> Self
    where
        F: Fn(HashMap<String, serde_json::Value>, WorkflowContext, ProgressReporter) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<StepResult, StepFailure>> + Send + 'static,
    {
        let erased: AsyncTaskHandler =
            Arc::new(move |args, ctx, reporter| Box::pin(handler(args, ctx, reporter)) as _);
        self.async_handlers
            .push((AsyncPattern::parse(pattern), erased));
        self
    }

    /// Declare the workflow's output type
    pub fn returning<R: 'static>(mut self) -> Self {
        self.output = TypeToken::of::<R>();
        self
    }

    /// Validate and assemble the graph
    ///
    /// Rejects duplicate ids, dangling edges, a missing initial step, and
    /// steps unreachable from the initial step.
    pub fn build(self) -> Result<Graph, GraphError> {
        if let Some(error) = self.error {
            return Err(error);
        }

        let initial = self
            .initial
            .ok_or_else(|| GraphError::MissingInitialStep(self.id.clone()))?;

        let mut seen = HashSet::new();
        for def in &self.defs {
            if !seen.insert(def.id().to_string()) {
                return Err(GraphError::DuplicateStep(def.id().to_string()));
            }
        }

        let mut order = Vec::with_capacity(self.defs.len());
        let mut nodes = HashMap::with_capacity(self.defs.len());
        let mut input = TypeToken::value();
        for def in self.defs {
            let is_initial = def.id() == initial;
            let (id, def_input, def_output, handler, probe, config) = def.into_parts();
            if is_initial {
                input = def_input.clone();
            }
            order.push(id.clone());
            nodes.insert(
                id.clone(),
                StepNode::new(id, def_input, def_output, handler, probe, is_initial, config),
            );
        }

        let mut edges: HashMap<String, Vec<Edge>> = HashMap::new();
        for edge in self.edges {
            for end in [edge.from(), edge.to()] {
                if !nodes.contains_key(end) {
                    return Err(GraphError::UnknownStep(end.to_string()));
                }
            }
            edges.entry(edge.from().to_string()).or_default().push(edge);
        }

        // reachability from the initial step, over every edge kind
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([initial.clone()]);
        while let Some(id) = queue.pop_front() {
            if !visited.insert(id.clone()) {
                continue;
            }
            if let Some(outgoing) = edges.get(&id) {
                for edge in outgoing {
                    queue.push_back(edge.to().to_string());
                }
            }
        }
        for id in &order {
            if !visited.contains(id) {
                return Err(GraphError::UnreachableStep(id.clone()));
            }
        }

        Ok(Graph::new(
            self.id,
            self.version,
            input,
            self.output,
            nodes,
            order,
            edges,
            initial,
            self.async_handlers,
        ))
    }
}

/// Builder for the arms of a [`GraphBuilder::choose`] dispatch
pub struct ChoiceBuilder<V> {
    builder: GraphBuilder,
    decision_id: String,
    marker: TypeToken,
    _value: PhantomData<V>,
}

impl<V: Serialize> ChoiceBuilder<V> {
    /// Route to `flow` when the selector yields `value`
    pub fn when(mut self, value: V, flow: Flow) -> Self {
        match (serde_json::to_value(&value), flow.first_id()) {
            (Ok(json), Some(first)) => {
                self.builder.edges.push(Edge::BranchOnValue {
                    from: self.decision_id.clone(),
                    to: first,
                    marker: self.marker.clone(),
                    value: json,
                });
                self.builder.add_flow(flow);
            }
            (Err(e), _) => self.builder.record_error(GraphError::InvalidDefinition(
                format!("choice value for '{}' is not serializable: {e}", self.decision_id),
            )),
            (_, None) => self.builder.record_error(GraphError::InvalidDefinition(
                format!("choice arm for '{}' has an empty flow", self.decision_id),
            )),
        }
        self
    }

    /// Route everything unmatched to `flow`, completing the dispatch
    pub fn otherwise(mut self, flow: Flow) -> GraphBuilder {
        match flow.first_id() {
            Some(first) => {
                self.builder.edges.push(Edge::BranchOnType {
                    from: self.decision_id.clone(),
                    to: first,
                    marker: self.marker.clone(),
                });
                self.builder.add_flow(flow);
            }
            None => self.builder.record_error(GraphError::InvalidDefinition(
                format!("otherwise arm for '{}' has an empty flow", self.decision_id),
            )),
        }
        self.builder.current = None;
        self.builder
    }
}
