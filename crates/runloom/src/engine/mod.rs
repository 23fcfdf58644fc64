//! The engine façade
//!
//! Registers graphs, creates and resumes instances, dispatches execution
//! onto the worker pool, and exposes the query and cancellation surface.

mod config;
mod error;
mod execution;
mod listener;

use std::sync::Arc;

use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::asynctask::{AsyncTaskManager, ProgressTracker};
use crate::execution::{
    RetryExecutor, RetryListener, RetryMetrics, StepExecutor, StepInterceptor,
};
use crate::graph::Graph;
use crate::orchestrator::{Orchestrator, OrchestratorParts};
use crate::persistence::{
    AsyncStepStateRepository, InMemoryAsyncStepStateRepository, InMemoryStateRepository,
    InMemorySuspensionDataRepository, StateRepository, SuspensionDataRepository,
};
use crate::reliability::CircuitBreaker;
use crate::routing;
use crate::schema::{CachingSchemaProvider, SchemaProvider};
use crate::state::{
    ErrorInfo, ErrorKind, StepOutput, TypeToken, WorkflowContext, WorkflowInstance,
    WorkflowStatus, RESUMED_STEP_INPUT_KEY,
};
use crate::worker::WorkerPool;

pub use config::EngineConfig;
pub use error::EngineError;
pub use execution::{Execution, ProgressSnapshot};
pub use listener::{ListenerRegistry, WorkflowListener};

pub(crate) use execution::CompletionHub;

struct EngineInner {
    graphs: DashMap<String, Arc<Graph>>,
    state_repo: Arc<dyn StateRepository>,
    suspension_repo: Arc<dyn SuspensionDataRepository>,
    async_repo: Arc<dyn AsyncStepStateRepository>,
    tracker: Arc<ProgressTracker>,
    pool: Arc<WorkerPool>,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<RetryMetrics>,
    completions: Arc<CompletionHub>,
    listeners: Arc<ListenerRegistry>,
    cancellations: DashMap<String, CancellationToken>,
    orchestrator: Orchestrator,
    manager: AsyncTaskManager,
}

/// Assembles a [`WorkflowEngine`] with custom stores and hooks
pub struct EngineBuilder {
    config: EngineConfig,
    state_repo: Option<Arc<dyn StateRepository>>,
    suspension_repo: Option<Arc<dyn SuspensionDataRepository>>,
    async_repo: Option<Arc<dyn AsyncStepStateRepository>>,
    schema: Option<Arc<dyn SchemaProvider>>,
    interceptors: Vec<Arc<dyn StepInterceptor>>,
    retry_listeners: Vec<Arc<dyn RetryListener>>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            state_repo: None,
            suspension_repo: None,
            async_repo: None,
            schema: None,
            interceptors: Vec::new(),
            retry_listeners: Vec::new(),
        }
    }
}

impl EngineBuilder {
    /// Set the engine configuration
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom instance snapshot store
    pub fn with_state_repository(mut self, repo: Arc<dyn StateRepository>) -> Self {
        self.state_repo = Some(repo);
        self
    }

    /// Use a custom suspension store
    pub fn with_suspension_repository(mut self, repo: Arc<dyn SuspensionDataRepository>) -> Self {
        self.suspension_repo = Some(repo);
        self
    }

    /// Use a custom async step state store
    pub fn with_async_repository(mut self, repo: Arc<dyn AsyncStepStateRepository>) -> Self {
        self.async_repo = Some(repo);
        self
    }

    /// Use a custom schema provider
    pub fn with_schema_provider(mut self, provider: Arc<dyn SchemaProvider>) -> Self {
        self.schema = Some(provider);
        self
    }

    /// Attach a step interceptor
    pub fn add_interceptor(mut self, interceptor: Arc<dyn StepInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Attach a retry listener
    pub fn add_retry_listener(mut self, listener: Arc<dyn RetryListener>) -> Self {
        self.retry_listeners.push(listener);
        self
    }

    /// Assemble the engine
    pub fn build(self) -> WorkflowEngine {
        let state_repo = self.state_repo.unwrap_or_else(|| {
            Arc::new(InMemoryStateRepository::with_capacity(
                self.config.state_capacity,
            ))
        });
        let suspension_repo = self
            .suspension_repo
            .unwrap_or_else(|| Arc::new(InMemorySuspensionDataRepository::new()));
        let async_repo = self
            .async_repo
            .unwrap_or_else(|| Arc::new(InMemoryAsyncStepStateRepository::new()));
        let schema = self
            .schema
            .unwrap_or_else(|| Arc::new(CachingSchemaProvider::new()));

        let tracker = Arc::new(ProgressTracker::new());
        let pool = Arc::new(WorkerPool::new(self.config.worker_pool.clone()));
        let breaker = Arc::new(CircuitBreaker::new(self.config.circuit_breaker.clone()));
        let metrics = Arc::new(RetryMetrics::new());
        let completions = Arc::new(CompletionHub::new());
        let listeners = Arc::new(ListenerRegistry::new());

        let retry = RetryExecutor::new(
            StepExecutor::with_interceptors(self.interceptors),
            breaker.clone(),
        )
        .with_metrics(metrics.clone())
        .with_listeners(self.retry_listeners);

        let manager = AsyncTaskManager::new(
            state_repo.clone(),
            suspension_repo.clone(),
            async_repo.clone(),
            tracker.clone(),
            pool.clone(),
        );

        let orchestrator = Orchestrator::new(OrchestratorParts {
            state_repo: state_repo.clone(),
            suspension_repo: suspension_repo.clone(),
            retry,
            schema,
            listeners: listeners.clone(),
            completions: completions.clone(),
            manager: manager.clone(),
        });

        WorkflowEngine {
            inner: Arc::new(EngineInner {
                graphs: DashMap::new(),
                state_repo,
                suspension_repo,
                async_repo,
                tracker,
                pool,
                breaker,
                metrics,
                completions,
                listeners,
                cancellations: DashMap::new(),
                orchestrator,
                manager,
            }),
        }
    }
}

/// Embedded workflow orchestration engine
///
/// # Example
///
/// ```
/// use runloom::engine::WorkflowEngine;
/// use runloom::graph::{GraphBuilder, StepDefinition};
/// use runloom::state::StepResult;
///
/// # tokio_test::block_on(async {
/// let engine = WorkflowEngine::new();
/// engine
///     .register(
///         GraphBuilder::new("double-up", "1.0")
///             .start_with(StepDefinition::of("double", |n: i64, _ctx| async move {
///                 StepResult::finish(n * 2).map_err(Into::into)
///             }))
///             .build()
///             .unwrap(),
///     )
///     .unwrap();
///
/// let execution = engine.execute::<i64, i64>("double-up", 21).await.unwrap();
/// assert_eq!(execution.result().await.unwrap(), 42);
/// # });
/// ```
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    /// Create an engine with in-memory stores and default configuration
    pub fn new() -> Self {
        EngineBuilder::default().build()
    }

    /// Start assembling a customized engine
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Register a graph; rejects duplicate ids
    pub fn register(&self, graph: Graph) -> Result<(), EngineError> {
        let id = graph.id().to_string();
        match self.inner.graphs.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(EngineError::DuplicateWorkflow(id))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                info!(workflow_id = %id, version = graph.version(), "registered workflow");
                slot.insert(Arc::new(graph));
                Ok(())
            }
        }
    }

    /// Look up a registered graph
    pub fn graph(&self, workflow_id: &str) -> Option<Arc<Graph>> {
        self.inner.graphs.get(workflow_id).map(|g| g.clone())
    }

    /// Start a fresh instance with a generated id
    pub async fn execute<I, R>(
        &self,
        workflow_id: &str,
        input: I,
    ) -> Result<Execution<R>, EngineError>
    where
        I: Serialize + Send + 'static,
        R: DeserializeOwned + 'static,
    {
        self.start(workflow_id, input, None, None).await
    }

    /// Start with a caller-supplied instance id
    ///
    /// When an instance with that id exists and is suspended, this resumes
    /// it with `input`; any other existing status is rejected.
    pub async fn execute_with_instance<I, R>(
        &self,
        workflow_id: &str,
        input: I,
        instance_id: &str,
    ) -> Result<Execution<R>, EngineError>
    where
        I: Serialize + Send + 'static,
        R: DeserializeOwned + 'static,
    {
        self.start(workflow_id, input, Some(instance_id.to_string()), None)
            .await
    }

    /// Start with a caller-supplied instance id and chat correlation id
    pub async fn execute_with_chat<I, R>(
        &self,
        workflow_id: &str,
        input: I,
        instance_id: &str,
        chat_id: &str,
    ) -> Result<Execution<R>, EngineError>
    where
        I: Serialize + Send + 'static,
        R: DeserializeOwned + 'static,
    {
        self.start(
            workflow_id,
            input,
            Some(instance_id.to_string()),
            Some(chat_id.to_string()),
        )
        .await
    }

    #[instrument(skip(self, input, chat_id))]
    async fn start<I, R>(
        &self,
        workflow_id: &str,
        input: I,
        instance_id: Option<String>,
        chat_id: Option<String>,
    ) -> Result<Execution<R>, EngineError>
    where
        I: Serialize + Send + 'static,
        R: DeserializeOwned + 'static,
    {
        if workflow_id.is_empty() {
            return Err(EngineError::InvalidArgument(
                "workflow id must not be empty".to_string(),
            ));
        }
        let graph = self
            .graph(workflow_id)
            .ok_or_else(|| EngineError::UnknownWorkflow(workflow_id.to_string()))?;

        if let Some(id) = &instance_id {
            if let Some(existing) = self.inner.state_repo.load(id).await? {
                return match existing.status {
                    WorkflowStatus::Suspended => self.resume(id, input).await,
                    status => Err(EngineError::StateViolation(format!(
                        "instance '{id}' already exists with status {status}"
                    ))),
                };
            }
        }

        let instance_id = instance_id.unwrap_or_else(|| Uuid::now_v7().to_string());
        let trigger = StepOutput::of(&input)?;
        let context = WorkflowContext::new(&instance_id, trigger);
        let mut instance = WorkflowInstance::new(
            graph.id(),
            graph.version(),
            context,
            graph.initial_step_id(),
        );
        if let Some(chat_id) = chat_id {
            instance = instance.with_chat_id(chat_id);
        }

        self.inner.state_repo.save(&instance).await?;
        let rx = self.inner.completions.register(&instance_id);
        let cancel = CancellationToken::new();
        self.inner
            .cancellations
            .insert(instance_id.clone(), cancel.clone());

        info!(workflow_id, %instance_id, "starting workflow instance");
        self.inner.listeners.on_workflow_started(&instance).await;

        let orchestrator = self.inner.orchestrator.clone();
        let graph_for_run = graph.clone();
        self.inner
            .pool
            .spawn(async move {
                orchestrator.run(graph_for_run, instance, cancel).await;
            })
            .await;

        Ok(Execution::new(instance_id, rx))
    }

    /// Resume a suspended instance with a typed input
    ///
    /// The input type must be assignable to the suspension's declared
    /// resumption type; the next step is the suspended step's first
    /// accepting successor, falling back to any step accepting the type.
    #[instrument(skip(self, input))]
    pub async fn resume<I, R>(
        &self,
        instance_id: &str,
        input: I,
    ) -> Result<Execution<R>, EngineError>
    where
        I: Serialize + Send + 'static,
        R: DeserializeOwned + 'static,
    {
        let mut instance = self
            .inner
            .state_repo
            .load(instance_id)
            .await?
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.to_string()))?;
        if instance.status != WorkflowStatus::Suspended {
            return Err(EngineError::StateViolation(format!(
                "instance '{instance_id}' is {}, only suspended instances can resume",
                instance.status
            )));
        }

        let graph = self
            .graph(&instance.workflow_id)
            .ok_or_else(|| EngineError::UnknownWorkflow(instance.workflow_id.clone()))?;
        let suspension = self
            .inner
            .suspension_repo
            .find_by_instance(instance_id)
            .await?
            .ok_or_else(|| {
                EngineError::StateViolation(format!(
                    "no suspension data for instance '{instance_id}'"
                ))
            })?;

        let token = TypeToken::of::<I>();
        if let Some(expected) = &suspension.next_input {
            if !expected.accepts(&token) {
                return Err(EngineError::TypeMismatch(format!(
                    "resume input type {token} is not assignable to expected {expected}"
                )));
            }
        }

        let value = StepOutput::of(&input)?;
        if let Some(original) = suspension.original_step_input.clone() {
            instance.context.set_output(RESUMED_STEP_INPUT_KEY, original);
        }
        instance.context.set_user_input(value.clone(), &token)?;

        let next_step_id = routing::find_next_step(&graph, &suspension.suspended_step_id, &value)
            .or_else(|| {
                routing::find_step_for_input_type(&graph, &token, &suspension.suspended_step_id)
            })
            .map(|step| step.id().to_string());

        let Some(next_step_id) = next_step_id else {
            let info = ErrorInfo::new(
                ErrorKind::RoutingFailure,
                format!("no step accepts resume input of type {token}"),
            )
            .at_step(&suspension.suspended_step_id);
            let rx = self.inner.completions.register(instance_id);
            let _ = self.inner.suspension_repo.delete(instance_id).await;
            self.inner.orchestrator.fail_instance(instance, info).await;
            return Ok(Execution::new(instance_id.to_string(), rx));
        };

        instance.try_transition(WorkflowStatus::Running);
        instance.current_step_id = Some(next_step_id);
        self.inner.suspension_repo.delete(instance_id).await?;
        self.inner.state_repo.save(&instance).await?;

        let rx = self.inner.completions.register(instance_id);
        let cancel = self
            .inner
            .cancellations
            .entry(instance_id.to_string())
            .or_insert_with(CancellationToken::new)
            .clone();

        info!(%instance_id, "resuming workflow instance");
        self.inner.listeners.on_workflow_resumed(&instance).await;

        let orchestrator = self.inner.orchestrator.clone();
        let graph_for_run = graph.clone();
        self.inner
            .pool
            .spawn(async move {
                orchestrator.run(graph_for_run, instance, cancel).await;
            })
            .await;

        Ok(Execution::new(instance_id.to_string(), rx))
    }

    /// Request cancellation of an instance's running async task
    pub async fn cancel_async_operation(&self, instance_id: &str) -> bool {
        self.inner.manager.cancel(instance_id).await
    }

    /// Cancel every future tied to an instance (retry waits, attached
    /// futures, dispatched handlers)
    pub fn cancel_async_tasks(&self, instance_id: &str) {
        if let Some(token) = self.inner.cancellations.get(instance_id) {
            token.cancel();
        }
    }

    /// Cancel an instance
    ///
    /// Cancels every future tied to the instance. A suspended instance
    /// (owned by the repository) transitions to Cancelled immediately and
    /// its handle resolves with a cancellation error; a running instance
    /// is not preempted; its worker observes the cancellation at the next
    /// cancellable point. Returns false for unknown or terminal instances.
    pub async fn cancel_instance(&self, instance_id: &str) -> Result<bool, EngineError> {
        let Some(mut instance) = self.inner.state_repo.load(instance_id).await? else {
            return Ok(false);
        };
        if instance.is_terminal() {
            return Ok(false);
        }

        self.cancel_async_tasks(instance_id);

        if instance.status == WorkflowStatus::Suspended {
            let _ = self.inner.manager.cancel(instance_id).await;
            let _ = self.inner.suspension_repo.delete(instance_id).await;
            instance.try_transition(WorkflowStatus::Cancelled);
            self.inner.state_repo.save(&instance).await?;
            self.inner.completions.complete_err(
                instance_id,
                ErrorInfo::new(ErrorKind::Cancellation, "workflow cancelled"),
            );
            info!(%instance_id, "suspended workflow cancelled");
            self.inner.listeners.on_workflow_cancelled(&instance).await;
        }
        Ok(true)
    }

    /// Progress/result snapshot for an instance
    ///
    /// While an async task is in flight this carries its percent and
    /// message; a non-async suspension carries the prompt; otherwise the
    /// status with 0% (live) or 100% (terminal).
    pub async fn current_result(
        &self,
        instance_id: &str,
    ) -> Result<Option<ProgressSnapshot>, EngineError> {
        let Some(instance) = self.inner.state_repo.load(instance_id).await? else {
            return Ok(None);
        };

        let snapshot = match instance.status {
            WorkflowStatus::Suspended => {
                match self.inner.suspension_repo.find_by_instance(instance_id).await? {
                    Some(suspension) if suspension.is_async() => {
                        let progress = match self.inner.tracker.get(suspension.message_id) {
                            Some(p) => Some((p.percent, p.message)),
                            None => self
                                .inner
                                .async_repo
                                .find(suspension.message_id)
                                .await?
                                .map(|s| (s.percent_complete, s.status_message)),
                        };
                        let (percent, message) = progress.unwrap_or((0, None));
                        ProgressSnapshot {
                            status: instance.status,
                            percent,
                            message,
                        }
                    }
                    Some(suspension) => {
                        let message = suspension.prompt.json().ok().map(|v| match v.as_str() {
                            Some(s) => s.to_string(),
                            None => v.to_string(),
                        });
                        ProgressSnapshot {
                            status: instance.status,
                            percent: 0,
                            message,
                        }
                    }
                    None => ProgressSnapshot {
                        status: instance.status,
                        percent: 0,
                        message: None,
                    },
                }
            }
            status if status.is_terminal() => ProgressSnapshot {
                status,
                percent: 100,
                message: None,
            },
            status => ProgressSnapshot {
                status,
                percent: 0,
                message: None,
            },
        };
        Ok(Some(snapshot))
    }

    /// Defensive snapshot of an instance
    pub async fn instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<WorkflowInstance>, EngineError> {
        Ok(self.inner.state_repo.load(instance_id).await?)
    }

    /// Add or replace a workflow listener under an id
    pub fn add_listener(&self, id: impl Into<String>, listener: Arc<dyn WorkflowListener>) {
        self.inner.listeners.add(id, listener);
    }

    /// Remove a workflow listener; returns whether one was registered
    pub fn remove_listener(&self, id: &str) -> bool {
        self.inner.listeners.remove(id)
    }

    /// Per-step retry metrics
    pub fn retry_metrics(&self) -> &RetryMetrics {
        &self.inner.metrics
    }

    /// Per-step circuit breaker state
    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    /// Drain workers and stop, waiting up to the configured grace period
    ///
    /// When the grace period expires with work still running, every
    /// instance's cancellation token fires so stuck workers unwind at
    /// their next cancellable point.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        match self.inner.pool.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) => {
                for entry in self.inner.cancellations.iter() {
                    entry.value().cancel();
                }
                Err(e.into())
            }
        }
    }
}

impl Default for WorkflowEngine {
    fn default() -> Self {
        Self::new()
    }
}
