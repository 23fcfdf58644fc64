//! The orchestration loop
//!
//! Consumes one [`StepResult`] at a time and mutates instance state
//! accordingly: routing on `Continue`/`Branch`, durable pauses on
//! `Suspend`/`Async`, terminal transitions on `Finish`/`Fail`. The
//! instance snapshot is persisted after every transition, so any observer
//! loading it from the repository sees the latest state.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::asynctask::{AsyncLaunch, AsyncTaskManager};
use crate::engine::CompletionHub;
use crate::engine::ListenerRegistry;
use crate::execution::RetryExecutor;
use crate::graph::Graph;
use crate::persistence::{StateRepository, SuspensionData, SuspensionDataRepository};
use crate::routing;
use crate::schema::SchemaProvider;
use crate::state::{
    ErrorInfo, ErrorKind, StepResult, WorkflowInstance, WorkflowStatus,
};

/// Dependencies wired into the orchestrator by the engine
pub(crate) struct OrchestratorParts {
    pub state_repo: Arc<dyn StateRepository>,
    pub suspension_repo: Arc<dyn SuspensionDataRepository>,
    pub retry: RetryExecutor,
    pub schema: Arc<dyn SchemaProvider>,
    pub listeners: Arc<ListenerRegistry>,
    pub completions: Arc<CompletionHub>,
    pub manager: AsyncTaskManager,
}

/// Drives workflow instances through their graphs
///
/// Cheap to clone; all state lives behind `Arc`. Exactly one clone drives
/// a given instance at a time (the single-worker invariant); cross-task
/// hand-offs go through the repositories.
#[derive(Clone)]
pub(crate) struct Orchestrator {
    inner: Arc<OrchestratorParts>,
}

impl Orchestrator {
    pub(crate) fn new(parts: OrchestratorParts) -> Self {
        Self {
            inner: Arc::new(parts),
        }
    }

    /// Drive an instance until it suspends or terminates
    pub(crate) async fn run(
        &self,
        graph: Arc<Graph>,
        instance: WorkflowInstance,
        cancel: CancellationToken,
    ) {
        self.run_loop(graph, instance, cancel).await;
    }

    /// Feed an externally produced result (an async handler's) into the
    /// loop for `step_id`, then keep driving the instance
    ///
    /// Boxed so the async completion path can re-enter the loop without an
    /// infinitely recursive future type.
    pub(crate) fn continue_with(
        &self,
        graph: Arc<Graph>,
        instance: WorkflowInstance,
        step_id: String,
        result: StepResult,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, ()> {
        let this = self.clone();
        Box::pin(async move {
            match this.apply(&graph, instance, &step_id, result, &cancel).await {
                Some(instance) => this.run_loop(graph, instance, cancel).await,
                None => {}
            }
        })
    }

    async fn run_loop(
        &self,
        graph: Arc<Graph>,
        mut instance: WorkflowInstance,
        cancel: CancellationToken,
    ) {
        while instance.status == WorkflowStatus::Running {
            let Some(step_id) = instance.current_step_id.clone() else {
                let info = ErrorInfo::new(
                    ErrorKind::Internal,
                    "running instance has no current step",
                );
                self.fail_instance(instance, info).await;
                return;
            };
            let Some(step) = graph.node(&step_id) else {
                let info = ErrorInfo::new(
                    ErrorKind::Internal,
                    format!("step '{step_id}' not found in graph '{}'", graph.id()),
                )
                .at_step(&step_id);
                self.fail_instance(instance, info).await;
                return;
            };

            self.inner.listeners.on_step_started(&instance, &step_id).await;
            match self.inner.retry.execute(&mut instance, step, &cancel).await {
                Ok(result) => {
                    debug!(
                        instance_id = %instance.instance_id,
                        step_id = %step_id,
                        outcome = result.variant(),
                        "step finished"
                    );
                    self.inner
                        .listeners
                        .on_step_completed(&instance, &step_id)
                        .await;
                    match self.apply(&graph, instance, &step_id, result, &cancel).await {
                        Some(next) => instance = next,
                        None => return,
                    }
                }
                Err(failure) => {
                    self.inner
                        .listeners
                        .on_step_failed(&instance, &step_id, &failure)
                        .await;
                    let info = ErrorInfo::from_failure(&failure, ErrorKind::NonRetryable)
                        .at_step(&step_id);
                    self.fail_instance(instance, info).await;
                    return;
                }
            }
        }
    }

    /// Dispatch one result; returns the instance when the loop should keep
    /// going, None when it suspended, terminated, or was handed off
    async fn apply(
        &self,
        graph: &Arc<Graph>,
        mut instance: WorkflowInstance,
        step_id: &str,
        result: StepResult,
        cancel: &CancellationToken,
    ) -> Option<WorkflowInstance> {
        match result {
            StepResult::Continue { data } => {
                instance.context.set_output(step_id, data.clone());
                match routing::find_next_step(graph, step_id, &data) {
                    Some(next) => {
                        instance.current_step_id = Some(next.id().to_string());
                        if self.save(&instance).await.is_err() {
                            return None;
                        }
                        Some(instance)
                    }
                    None => {
                        let produced = data
                            .type_token()
                            .map(|t| t.name().to_string())
                            .unwrap_or_else(|| "<empty>".to_string());
                        let info = ErrorInfo::new(
                            ErrorKind::RoutingFailure,
                            format!("no next step accepts output of type {produced} from '{step_id}'"),
                        )
                        .at_step(step_id);
                        self.fail_instance(instance, info).await;
                        None
                    }
                }
            }

            StepResult::Branch { event } => {
                // routing marker only, never stored in the data flow
                match routing::find_branch_target(graph, step_id, &event) {
                    Some(target) => {
                        instance.current_step_id = Some(target.id().to_string());
                        if self.save(&instance).await.is_err() {
                            return None;
                        }
                        Some(instance)
                    }
                    None => {
                        let info = ErrorInfo::new(
                            ErrorKind::RoutingFailure,
                            format!(
                                "no branch target for marker {} from '{step_id}'",
                                event.marker()
                            ),
                        )
                        .at_step(step_id);
                        self.fail_instance(instance, info).await;
                        None
                    }
                }
            }

            StepResult::Suspend {
                prompt,
                next_input,
                next_input_schema,
                metadata,
            } => {
                self.inner
                    .schema
                    .register(&next_input, next_input_schema.as_ref());

                let original_input = instance
                    .last_execution_of(step_id)
                    .and_then(|r| r.input.clone());
                if !instance.try_transition(WorkflowStatus::Suspended) {
                    let info = ErrorInfo::new(
                        ErrorKind::StateViolation,
                        format!("instance cannot suspend from status {}", instance.status),
                    )
                    .at_step(step_id);
                    self.fail_instance(instance, info).await;
                    return None;
                }
                instance.context.set_output(step_id, prompt.clone());

                let suspension = SuspensionData::new(&instance.instance_id, step_id, prompt)
                    .with_original_input(original_input)
                    .with_next_input(next_input)
                    .with_metadata(metadata);

                // the suspension record goes first: an observer that sees
                // the Suspended snapshot must be able to resume immediately
                if let Err(e) = self.inner.suspension_repo.save(&suspension).await {
                    let info = ErrorInfo::new(
                        ErrorKind::Infrastructure,
                        format!("failed to persist suspension: {e}"),
                    )
                    .at_step(step_id);
                    self.fail_instance(instance, info).await;
                    return None;
                }
                if self.save(&instance).await.is_err() {
                    let _ = self
                        .inner
                        .suspension_repo
                        .delete(&instance.instance_id)
                        .await;
                    return None;
                }

                info!(
                    instance_id = %instance.instance_id,
                    step_id = %step_id,
                    message_id = %suspension.message_id,
                    "workflow suspended"
                );
                self.inner.listeners.on_workflow_suspended(&instance).await;
                None
            }

            StepResult::Finish { data } => {
                instance.context.set_final_output(data.clone());
                if !instance.try_transition(WorkflowStatus::Completed) {
                    let info = ErrorInfo::new(
                        ErrorKind::StateViolation,
                        format!("instance cannot complete from status {}", instance.status),
                    )
                    .at_step(step_id);
                    self.fail_instance(instance, info).await;
                    return None;
                }
                if self.save(&instance).await.is_err() {
                    return None;
                }
                info!(instance_id = %instance.instance_id, "workflow completed");
                self.inner
                    .completions
                    .complete_ok(&instance.instance_id, data);
                self.inner.listeners.on_workflow_completed(&instance).await;
                None
            }

            StepResult::Fail { error } => {
                let info =
                    ErrorInfo::from_failure(&error, ErrorKind::NonRetryable).at_step(step_id);
                self.fail_instance(instance, info).await;
                None
            }

            StepResult::Async {
                task_id,
                estimated_ms,
                task_args,
                immediate,
                attached,
            } => {
                self.inner
                    .manager
                    .launch(
                        self.clone(),
                        graph.clone(),
                        instance,
                        step_id.to_string(),
                        AsyncLaunch {
                            task_id,
                            estimated_ms,
                            task_args,
                            immediate,
                            attached,
                        },
                        cancel.clone(),
                    )
                    .await;
                None
            }
        }
    }

    /// Persist a snapshot; on infrastructure failure the instance's future
    /// completes exceptionally and the loop stops
    async fn save(&self, instance: &WorkflowInstance) -> Result<(), ()> {
        match self.inner.state_repo.save(instance).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(
                    instance_id = %instance.instance_id,
                    error = %e,
                    "failed to persist instance"
                );
                let info = ErrorInfo::new(
                    ErrorKind::Infrastructure,
                    format!("failed to persist instance: {e}"),
                );
                self.inner
                    .completions
                    .complete_err(&instance.instance_id, info.clone());
                self.inner.listeners.on_workflow_failed(instance, &info).await;
                Err(())
            }
        }
    }

    /// Record the error, transition to Failed, persist, and complete the
    /// outer future exceptionally
    pub(crate) async fn fail_instance(&self, mut instance: WorkflowInstance, info: ErrorInfo) {
        error!(
            instance_id = %instance.instance_id,
            error = %info,
            "workflow failed"
        );
        if instance.status == WorkflowStatus::Suspended {
            instance.try_transition(WorkflowStatus::Running);
        }
        instance.mark_failed(info.clone());
        if let Err(e) = self.inner.state_repo.save(&instance).await {
            error!(
                instance_id = %instance.instance_id,
                error = %e,
                "failed to persist failed instance"
            );
        }
        self.inner
            .completions
            .complete_err(&instance.instance_id, info.clone());
        self.inner.listeners.on_workflow_failed(&instance, &info).await;
    }

    /// Notify listeners of a suspension recorded outside `apply` (the
    /// async manager's suspension path)
    pub(crate) async fn notify_suspended(&self, instance: &WorkflowInstance) {
        self.inner.listeners.on_workflow_suspended(instance).await;
    }
}
