//! Single-step execution

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, warn};

use crate::graph::{StepContext, StepNode};
use crate::routing;
use crate::state::{ExecutionRecord, StepFailure, StepResult, WorkflowInstance};

use super::interceptor::StepInterceptor;

/// Invokes one step: prepares its input, applies interceptors, runs the
/// executor, and records the execution in the instance's history
pub struct StepExecutor {
    interceptors: Vec<Arc<dyn StepInterceptor>>,
}

impl StepExecutor {
    /// Create an executor with no interceptors
    pub fn new() -> Self {
        Self {
            interceptors: Vec::new(),
        }
    }

    /// Create an executor with the given interceptors
    pub fn with_interceptors(interceptors: Vec<Arc<dyn StepInterceptor>>) -> Self {
        Self { interceptors }
    }

    /// Execute a step once
    ///
    /// The first interceptor returning an override result short-circuits
    /// the step's own executor. Interceptor failures are logged and never
    /// mask the step's outcome. Both success and failure are appended to
    /// the instance's history with timing.
    pub async fn execute_step(
        &self,
        instance: &mut WorkflowInstance,
        step: &StepNode,
        attempt: u32,
    ) -> Result<StepResult, StepFailure> {
        let input = routing::prepare_input(instance, step);
        let ctx = StepContext::new(step.id(), attempt, instance.context.clone());

        let mut override_result = None;
        for interceptor in &self.interceptors {
            match interceptor.before_step(instance, step, input.as_ref()).await {
                Ok(Some(result)) => {
                    debug!(step_id = step.id(), "interceptor override applied");
                    override_result = Some(result);
                    break;
                }
                Ok(None) => {}
                Err(e) => warn!(step_id = step.id(), error = %e, "before_step interceptor failed"),
            }
        }

        let started = Instant::now();
        let outcome = match override_result {
            Some(result) => Ok(result),
            None => (step.handler())(input.clone(), ctx).await,
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => {
                instance.record_execution(ExecutionRecord {
                    step_id: step.id().to_string(),
                    input,
                    output: result.output_snapshot(),
                    duration_ms,
                    success: true,
                    timestamp: Utc::now(),
                });
                for interceptor in &self.interceptors {
                    if let Err(e) = interceptor.after_step(instance, step, &result).await {
                        warn!(step_id = step.id(), error = %e, "after_step interceptor failed");
                    }
                }
                Ok(result)
            }
            Err(failure) => {
                instance.record_execution(ExecutionRecord {
                    step_id: step.id().to_string(),
                    input,
                    output: None,
                    duration_ms,
                    success: false,
                    timestamp: Utc::now(),
                });
                for interceptor in &self.interceptors {
                    if let Err(e) = interceptor.on_step_error(instance, step, &failure).await {
                        warn!(step_id = step.id(), error = %e, "on_step_error interceptor failed");
                    }
                }
                Err(failure)
            }
        }
    }
}

impl Default for StepExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphBuilder, StepDefinition, StepNode};
    use crate::state::{StepOutput, WorkflowContext};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fixture(def: StepDefinition) -> (crate::graph::Graph, WorkflowInstance) {
        let graph = GraphBuilder::new("wf", "1.0").start_with(def).build().unwrap();
        let ctx = WorkflowContext::new("run-1", StepOutput::of(&5i64).unwrap());
        let instance =
            WorkflowInstance::new(graph.id(), graph.version(), ctx, graph.initial_step_id());
        (graph, instance)
    }

    fn node<'g>(graph: &'g crate::graph::Graph) -> &'g StepNode {
        graph.node(graph.initial_step_id()).unwrap()
    }

    #[tokio::test]
    async fn test_success_is_recorded_with_output() {
        let (graph, mut instance) =
            fixture(StepDefinition::value("double", |n: i64, _ctx| async move { Ok(n * 2) }));
        let executor = StepExecutor::new();

        let result = executor
            .execute_step(&mut instance, node(&graph), 1)
            .await
            .unwrap();

        assert!(matches!(result, StepResult::Continue { .. }));
        let record = instance.last_execution_of("double").unwrap();
        assert!(record.success);
        assert_eq!(record.input.as_ref().unwrap().value::<i64>().unwrap(), 5);
        assert_eq!(record.output.as_ref().unwrap().value::<i64>().unwrap(), 10);
    }

    #[tokio::test]
    async fn test_failure_is_recorded_and_rethrown() {
        let (graph, mut instance) = fixture(StepDefinition::of("boom", |_: i64, _ctx| async move {
            Err::<StepResult, _>(StepFailure::new("kaput").with_type("KaputError"))
        }));
        let executor = StepExecutor::new();

        let err = executor
            .execute_step(&mut instance, node(&graph), 1)
            .await
            .unwrap_err();
        assert_eq!(err.error_type.as_deref(), Some("KaputError"));

        let record = instance.last_execution_of("boom").unwrap();
        assert!(!record.success);
        assert!(record.output.is_none());
    }

    struct OverrideInterceptor;

    #[async_trait]
    impl StepInterceptor for OverrideInterceptor {
        async fn before_step(
            &self,
            _instance: &WorkflowInstance,
            _step: &StepNode,
            _input: Option<&StepOutput>,
        ) -> anyhow::Result<Option<StepResult>> {
            Ok(Some(StepResult::next(99i64)?))
        }
    }

    #[tokio::test]
    async fn test_interceptor_override_skips_executor() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_step = calls.clone();
        let (graph, mut instance) = fixture(StepDefinition::value("s", move |n: i64, _ctx| {
            calls_in_step.fetch_add(1, Ordering::SeqCst);
            async move { Ok(n) }
        }));
        let executor = StepExecutor::with_interceptors(vec![Arc::new(OverrideInterceptor)]);

        let result = executor
            .execute_step(&mut instance, node(&graph), 1)
            .await
            .unwrap();

        match result {
            StepResult::Continue { data } => assert_eq!(data.value::<i64>().unwrap(), 99),
            other => panic!("expected Continue, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    struct FailingInterceptor;

    #[async_trait]
    impl StepInterceptor for FailingInterceptor {
        async fn before_step(
            &self,
            _instance: &WorkflowInstance,
            _step: &StepNode,
            _input: Option<&StepOutput>,
        ) -> anyhow::Result<Option<StepResult>> {
            anyhow::bail!("interceptor exploded")
        }

        async fn after_step(
            &self,
            _instance: &WorkflowInstance,
            _step: &StepNode,
            _result: &StepResult,
        ) -> anyhow::Result<()> {
            anyhow::bail!("after hook exploded")
        }
    }

    #[tokio::test]
    async fn test_interceptor_failures_never_mask_outcomes() {
        let (graph, mut instance) =
            fixture(StepDefinition::value("s", |n: i64, _ctx| async move { Ok(n + 1) }));
        let executor = StepExecutor::with_interceptors(vec![Arc::new(FailingInterceptor)]);

        let result = executor
            .execute_step(&mut instance, node(&graph), 1)
            .await
            .unwrap();
        match result {
            StepResult::Continue { data } => assert_eq!(data.value::<i64>().unwrap(), 6),
            other => panic!("expected Continue, got {other:?}"),
        }
    }
}
