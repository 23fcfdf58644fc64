//! Step execution interceptors
//!
//! Interceptors observe and optionally override step executions. Their
//! failures are logged and swallowed; they can never change a workflow's
//! outcome except through an explicit override result.

use async_trait::async_trait;

use crate::graph::StepNode;
use crate::state::{StepFailure, StepOutput, StepResult, WorkflowInstance};

/// Hooks around a single step execution
#[async_trait]
pub trait StepInterceptor: Send + Sync {
    /// Called before the step's executor runs
    ///
    /// Returning `Some(result)` overrides the execution: the step's own
    /// executor is skipped and the returned result is used instead.
    async fn before_step(
        &self,
        _instance: &WorkflowInstance,
        _step: &StepNode,
        _input: Option<&StepOutput>,
    ) -> anyhow::Result<Option<StepResult>> {
        Ok(None)
    }

    /// Called after a successful execution
    async fn after_step(
        &self,
        _instance: &WorkflowInstance,
        _step: &StepNode,
        _result: &StepResult,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called when the execution failed
    async fn on_step_error(
        &self,
        _instance: &WorkflowInstance,
        _step: &StepNode,
        _error: &StepFailure,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}
