//! Async task lifecycle
//!
//! When a step resolves to `Async`, its real work happens off the
//! orchestration path: the instance suspends durably, a handler (or an
//! attached future) runs on the worker pool, progress flows through the
//! async step state, and the handler's eventual result re-enters the
//! orchestrator. Back-references always go instance-id → repository, never
//! through an owning pointer, so the callback can outlive any particular
//! snapshot of the instance.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::graph::Graph;
use crate::orchestrator::Orchestrator;
use crate::persistence::{
    AsyncStepState, AsyncStepStateRepository, AsyncStepStatus, StateRepository, SuspensionData,
    SuspensionDataRepository,
};
use crate::state::{
    AsyncOutcome, AttachedFuture, ErrorInfo, ErrorKind, StepFailure, StepOutput, StepResult,
    WorkflowStatus,
};
use crate::worker::WorkerPool;

use super::progress::{ProgressReporter, ProgressTracker};

/// The parts of an `Async` step result handed to the manager
pub(crate) struct AsyncLaunch {
    pub task_id: String,
    pub estimated_ms: u64,
    pub task_args: HashMap<String, serde_json::Value>,
    pub immediate: StepOutput,
    pub attached: Option<AttachedFuture>,
}

/// Runs async handlers off the execution path and feeds their results
/// back into the orchestrator
#[derive(Clone)]
pub struct AsyncTaskManager {
    state_repo: Arc<dyn StateRepository>,
    suspension_repo: Arc<dyn SuspensionDataRepository>,
    async_repo: Arc<dyn AsyncStepStateRepository>,
    tracker: Arc<ProgressTracker>,
    pool: Arc<WorkerPool>,
}

impl AsyncTaskManager {
    /// Create a manager over the given stores and pool
    pub fn new(
        state_repo: Arc<dyn StateRepository>,
        suspension_repo: Arc<dyn SuspensionDataRepository>,
        async_repo: Arc<dyn AsyncStepStateRepository>,
        tracker: Arc<ProgressTracker>,
        pool: Arc<WorkerPool>,
    ) -> Self {
        Self {
            state_repo,
            suspension_repo,
            async_repo,
            tracker,
            pool,
        }
    }

    /// The progress tracker mirror
    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    /// Suspend the instance for an async task and dispatch its handler
    pub(crate) async fn launch(
        &self,
        orchestrator: Orchestrator,
        graph: Arc<Graph>,
        mut instance: crate::state::WorkflowInstance,
        step_id: String,
        mut launch: AsyncLaunch,
        cancel: CancellationToken,
    ) {
        let message_id = Uuid::now_v7();
        let task_id = launch.task_id.clone();

        let state = AsyncStepState::new(message_id, &task_id);
        if let Err(e) = self.async_repo.save(&state).await {
            let info = ErrorInfo::new(
                ErrorKind::Infrastructure,
                format!("failed to persist async state: {e}"),
            )
            .at_step(&step_id);
            orchestrator.fail_instance(instance, info).await;
            return;
        }
        self.tracker.record(&state);

        let original_input = instance
            .last_execution_of(&step_id)
            .and_then(|r| r.input.clone());
        let suspension = SuspensionData::new(&instance.instance_id, &step_id, launch.immediate.clone())
            .with_message_id(message_id)
            .with_original_input(original_input)
            .mark_async(&task_id);

        if !instance.try_transition(WorkflowStatus::Suspended) {
            let info = ErrorInfo::new(
                ErrorKind::StateViolation,
                format!("instance cannot suspend from status {}", instance.status),
            )
            .at_step(&step_id);
            orchestrator.fail_instance(instance, info).await;
            return;
        }
        instance.context.set_output(&step_id, launch.immediate.clone());

        // suspension record first, then the Suspended snapshot: observers
        // loading the instance must find the suspension already in place
        if let Err(e) = self.suspension_repo.save(&suspension).await {
            let info = ErrorInfo::new(
                ErrorKind::Infrastructure,
                format!("failed to persist suspension: {e}"),
            )
            .at_step(&step_id);
            orchestrator.fail_instance(instance, info).await;
            return;
        }
        if let Err(e) = self.state_repo.save(&instance).await {
            let _ = self.suspension_repo.delete(&instance.instance_id).await;
            let info = ErrorInfo::new(
                ErrorKind::Infrastructure,
                format!("failed to persist instance: {e}"),
            )
            .at_step(&step_id);
            orchestrator.fail_instance(instance, info).await;
            return;
        }
        orchestrator.notify_suspended(&instance).await;

        info!(
            instance_id = %instance.instance_id,
            step_id = %step_id,
            task_id = %task_id,
            %message_id,
            estimated_ms = launch.estimated_ms,
            "async task launched"
        );

        enum Source {
            Attached(AttachedFuture),
            Handler(crate::graph::AsyncTaskHandler),
        }

        let source = match launch.attached.take() {
            Some(future) => Source::Attached(future),
            None => match graph.resolve_async_handler(&task_id, &step_id) {
                Some(handler) => Source::Handler(handler.clone()),
                None => {
                    let info = ErrorInfo::new(
                        ErrorKind::InvalidArgument,
                        format!("no async handler registered for task '{task_id}'"),
                    )
                    .at_step(&step_id);
                    let _ = self.suspension_repo.delete(&instance.instance_id).await;
                    orchestrator.fail_instance(instance, info).await;
                    return;
                }
            },
        };

        let reporter = ProgressReporter::new(
            message_id,
            self.async_repo.clone(),
            self.tracker.clone(),
            cancel.clone(),
        );
        let context_snapshot = instance.context.clone();
        let instance_id = instance.instance_id.clone();
        let has_outgoing = graph.has_outgoing_sequential(&step_id);
        let task_args = std::mem::take(&mut launch.task_args);
        let manager = self.clone();

        self.pool
            .spawn(async move {
                let outcome: Result<StepResult, StepFailure> = match source {
                    Source::Attached(future) => {
                        tokio::select! {
                            result = future => result.map(|outcome| match outcome {
                                AsyncOutcome::Result(result) => *result,
                                AsyncOutcome::Value(output) => {
                                    if has_outgoing {
                                        StepResult::Continue { data: output }
                                    } else {
                                        StepResult::Finish { data: output }
                                    }
                                }
                            }),
                            _ = cancel.cancelled() => {
                                Err(StepFailure::cancelled("async future cancelled"))
                            }
                        }
                    }
                    Source::Handler(handler) => {
                        let future = handler(task_args, context_snapshot, reporter);
                        tokio::select! {
                            result = future => result,
                            _ = cancel.cancelled() => {
                                Err(StepFailure::cancelled("async task cancelled"))
                            }
                        }
                    }
                };

                manager
                    .complete(
                        orchestrator,
                        graph,
                        instance_id,
                        step_id,
                        message_id,
                        outcome,
                        cancel,
                    )
                    .await;
            })
            .await;
    }

    /// Deliver a handler's outcome back to the workflow
    #[allow(clippy::too_many_arguments)]
    async fn complete(
        &self,
        orchestrator: Orchestrator,
        graph: Arc<Graph>,
        instance_id: String,
        step_id: String,
        message_id: Uuid,
        outcome: Result<StepResult, StepFailure>,
        cancel: CancellationToken,
    ) {
        let state = match self.async_repo.find(message_id).await {
            Ok(state) => state,
            Err(e) => {
                error!(%message_id, error = %e, "failed to read async state");
                None
            }
        };
        let was_cancelled = cancel.is_cancelled()
            || matches!(&state, Some(s) if s.status == AsyncStepStatus::Cancelled);

        // state may have mutated while the handler ran: always re-read
        let instance = match self.state_repo.load(&instance_id).await {
            Ok(Some(instance)) => instance,
            Ok(None) => {
                warn!(%instance_id, "instance vanished while its async task ran");
                return;
            }
            Err(e) => {
                error!(%instance_id, error = %e, "failed to re-read instance");
                return;
            }
        };
        if instance.is_terminal() {
            debug!(%instance_id, status = %instance.status, "async result ignored, instance terminal");
            return;
        }

        if was_cancelled {
            self.finalize_state(state, message_id, AsyncStepStatus::Cancelled, None, None)
                .await;
            let _ = self.suspension_repo.delete(&instance_id).await;
            let info = ErrorInfo::new(ErrorKind::Cancellation, "async task cancelled")
                .at_step(&step_id);
            orchestrator.fail_instance(instance, info).await;
            return;
        }

        match outcome {
            Err(failure) => {
                self.finalize_state(
                    state,
                    message_id,
                    AsyncStepStatus::Failed,
                    None,
                    Some(failure.clone()),
                )
                .await;
                let _ = self.suspension_repo.delete(&instance_id).await;
                let info = ErrorInfo::from_failure(&failure, ErrorKind::NonRetryable)
                    .at_step(&step_id);
                orchestrator.fail_instance(instance, info).await;
            }

            // an async handler resolving to another Async is a programming
            // error the engine refuses to chain
            Ok(StepResult::Async { .. }) => {
                let failure = StepFailure::new("async handler returned another Async result")
                    .with_kind(ErrorKind::StateViolation);
                self.finalize_state(
                    state,
                    message_id,
                    AsyncStepStatus::Failed,
                    None,
                    Some(failure.clone()),
                )
                .await;
                let _ = self.suspension_repo.delete(&instance_id).await;
                let info = ErrorInfo::from_failure(&failure, ErrorKind::StateViolation)
                    .at_step(&step_id);
                orchestrator.fail_instance(instance, info).await;
            }

            Ok(result) => {
                self.finalize_state(
                    state,
                    message_id,
                    AsyncStepStatus::Completed,
                    result.output_snapshot(),
                    None,
                )
                .await;
                let _ = self.suspension_repo.delete(&instance_id).await;

                let mut instance = instance;
                if !instance.try_transition(WorkflowStatus::Running) {
                    let info = ErrorInfo::new(
                        ErrorKind::StateViolation,
                        format!("instance cannot resume from status {}", instance.status),
                    )
                    .at_step(&step_id);
                    orchestrator.fail_instance(instance, info).await;
                    return;
                }
                instance.current_step_id = Some(step_id.clone());
                if let Err(e) = self.state_repo.save(&instance).await {
                    let info = ErrorInfo::new(
                        ErrorKind::Infrastructure,
                        format!("failed to persist instance: {e}"),
                    )
                    .at_step(&step_id);
                    orchestrator.fail_instance(instance, info).await;
                    return;
                }

                orchestrator
                    .continue_with(graph, instance, step_id, result, cancel)
                    .await;
            }
        }
    }

    async fn finalize_state(
        &self,
        state: Option<AsyncStepState>,
        message_id: Uuid,
        status: AsyncStepStatus,
        result: Option<StepOutput>,
        error: Option<StepFailure>,
    ) {
        let Some(mut state) = state else {
            warn!(%message_id, "async state missing at completion");
            return;
        };
        // a cancelled state stays cancelled
        if state.status == AsyncStepStatus::Running {
            state.status = status;
        }
        if status == AsyncStepStatus::Completed {
            state.percent_complete = 100;
        }
        state.result = result;
        state.error = error;
        state.updated_at = Utc::now();
        if let Err(e) = self.async_repo.save(&state).await {
            warn!(%message_id, error = %e, "failed to persist async state");
        }
        self.tracker.record(&state);
    }

    /// Request cancellation of an instance's running async task
    ///
    /// Marks the async state Cancelled; the handler observes it through
    /// `is_cancelled` and is expected to exit promptly. Returns whether a
    /// running task was found.
    pub async fn cancel(&self, instance_id: &str) -> bool {
        let suspension = match self.suspension_repo.find_by_instance(instance_id).await {
            Ok(Some(s)) if s.is_async() => s,
            _ => return false,
        };
        match self.async_repo.find(suspension.message_id).await {
            Ok(Some(mut state)) if state.status == AsyncStepStatus::Running => {
                state.status = AsyncStepStatus::Cancelled;
                state.updated_at = Utc::now();
                match self.async_repo.save(&state).await {
                    Ok(()) => {
                        self.tracker.record(&state);
                        info!(instance_id, message_id = %state.message_id, "async task cancellation requested");
                        true
                    }
                    Err(e) => {
                        error!(instance_id, error = %e, "failed to persist cancellation");
                        false
                    }
                }
            }
            _ => false,
        }
    }
}
