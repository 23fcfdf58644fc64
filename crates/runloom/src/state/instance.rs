//! Workflow instance snapshot

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::context::WorkflowContext;
use super::failure::ErrorInfo;
use super::output::StepOutput;

/// Instance lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Instance is progressing on a worker
    Running,

    /// Instance is durably paused, awaiting input or an async result
    Suspended,

    /// Instance finished successfully
    Completed,

    /// Instance failed
    Failed,

    /// Instance was cancelled
    Cancelled,
}

impl WorkflowStatus {
    /// Whether this status is terminal (absorbing)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a transition from `self` to `to` is legal
    ///
    /// Running may move anywhere; Suspended may only resume or be
    /// cancelled; terminal states are absorbing.
    pub fn can_transition(&self, to: WorkflowStatus) -> bool {
        match self {
            Self::Running => true,
            Self::Suspended => matches!(to, Self::Running | Self::Cancelled),
            _ => false,
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Suspended => write!(f, "suspended"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One entry of an instance's ordered execution history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Step that executed
    pub step_id: String,

    /// Input the step received
    pub input: Option<StepOutput>,

    /// Output the step produced (None for failures and routing markers)
    pub output: Option<StepOutput>,

    /// Wall-clock duration of the execution
    pub duration_ms: u64,

    /// Whether the execution succeeded
    pub success: bool,

    /// When the execution finished
    pub timestamp: DateTime<Utc>,
}

/// A single execution of a graph with persistent state
///
/// The instance id equals the context's run id. While Running the instance
/// is exclusively owned by one worker; while Suspended it lives only in the
/// repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// Instance id (= context run id)
    pub instance_id: String,

    /// Graph id this instance executes
    pub workflow_id: String,

    /// Graph version at creation time
    pub workflow_version: String,

    /// Mutable instance state
    pub context: WorkflowContext,

    /// Lifecycle status
    pub status: WorkflowStatus,

    /// Step the orchestrator will execute next (None once terminal)
    pub current_step_id: Option<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last mutation timestamp
    pub updated_at: DateTime<Utc>,

    /// Completion timestamp, once terminal
    pub completed_at: Option<DateTime<Utc>>,

    /// Ordered execution history
    #[serde(default)]
    pub history: Vec<ExecutionRecord>,

    /// Free-form instance metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// Error record, once failed
    pub error: Option<ErrorInfo>,

    /// Optional chat correlation id for auditing collaborators
    pub chat_id: Option<String>,
}

impl WorkflowInstance {
    /// Create a fresh Running instance positioned at `initial_step`
    pub fn new(
        workflow_id: impl Into<String>,
        workflow_version: impl Into<String>,
        context: WorkflowContext,
        initial_step: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            instance_id: context.run_id().to_string(),
            workflow_id: workflow_id.into(),
            workflow_version: workflow_version.into(),
            context,
            status: WorkflowStatus::Running,
            current_step_id: Some(initial_step.into()),
            created_at: now,
            updated_at: now,
            completed_at: None,
            history: Vec::new(),
            metadata: HashMap::new(),
            error: None,
            chat_id: None,
        }
    }

    /// Attach a chat correlation id
    pub fn with_chat_id(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = Some(chat_id.into());
        self
    }

    /// Whether the instance is in a terminal status
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Attempt a status transition, enforcing the lifecycle rules
    ///
    /// Returns false (leaving the instance untouched) when the transition
    /// is illegal. Terminal transitions stamp `completed_at`.
    pub fn try_transition(&mut self, to: WorkflowStatus) -> bool {
        if self.status == to {
            self.updated_at = Utc::now();
            return true;
        }
        if !self.status.can_transition(to) {
            return false;
        }
        self.status = to;
        self.updated_at = Utc::now();
        if to.is_terminal() {
            self.completed_at = Some(self.updated_at);
            self.current_step_id = None;
        }
        true
    }

    /// Append an execution record and refresh `updated_at`
    pub fn record_execution(&mut self, record: ExecutionRecord) {
        self.updated_at = Utc::now();
        self.history.push(record);
    }

    /// The most recent history record for a step
    pub fn last_execution_of(&self, step_id: &str) -> Option<&ExecutionRecord> {
        self.history.iter().rev().find(|r| r.step_id == step_id)
    }

    /// Mark the instance failed with an error record
    pub fn mark_failed(&mut self, error: ErrorInfo) {
        self.try_transition(WorkflowStatus::Failed);
        self.error = Some(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StepOutput;

    fn instance() -> WorkflowInstance {
        let ctx = WorkflowContext::new("run-1", StepOutput::of(&1i64).unwrap());
        WorkflowInstance::new("wf", "1.0", ctx, "first")
    }

    #[test]
    fn test_new_instance_is_running() {
        let inst = instance();
        assert_eq!(inst.instance_id, "run-1");
        assert_eq!(inst.status, WorkflowStatus::Running);
        assert_eq!(inst.current_step_id.as_deref(), Some("first"));
        assert!(!inst.is_terminal());
    }

    #[test]
    fn test_legal_transitions() {
        let mut inst = instance();
        assert!(inst.try_transition(WorkflowStatus::Suspended));
        assert!(inst.try_transition(WorkflowStatus::Running));
        assert!(inst.try_transition(WorkflowStatus::Completed));
        assert!(inst.completed_at.is_some());
        assert!(inst.current_step_id.is_none());
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        let mut inst = instance();
        assert!(inst.try_transition(WorkflowStatus::Failed));
        assert!(!inst.try_transition(WorkflowStatus::Running));
        assert!(!inst.try_transition(WorkflowStatus::Completed));
        assert_eq!(inst.status, WorkflowStatus::Failed);
    }

    #[test]
    fn test_suspended_cannot_complete_directly() {
        let mut inst = instance();
        assert!(inst.try_transition(WorkflowStatus::Suspended));
        assert!(!inst.try_transition(WorkflowStatus::Completed));
        assert!(inst.try_transition(WorkflowStatus::Cancelled));
    }

    #[test]
    fn test_history_lookup_finds_most_recent() {
        let mut inst = instance();
        for success in [true, false] {
            inst.record_execution(ExecutionRecord {
                step_id: "first".to_string(),
                input: None,
                output: None,
                duration_ms: 1,
                success,
                timestamp: Utc::now(),
            });
        }
        let last = inst.last_execution_of("first").unwrap();
        assert!(!last.success);
    }
}
