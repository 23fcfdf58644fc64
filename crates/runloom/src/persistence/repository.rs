//! Repository contracts and auxiliary records
//!
//! Three stores back the engine: instance snapshots, suspension records, and
//! async step state. Implementations must be thread-safe; reads return
//! defensive copies so external mutation cannot corrupt stored state.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::{StepFailure, StepOutput, TypeToken, WorkflowInstance, WorkflowStatus};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Instance not found
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// Record not found
    #[error("record not found: {0}")]
    NotFound(String),

    /// Storage backend error
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Suspension metadata key marking an async suspension
const ASYNC_METADATA_KEY: &str = "async";

/// Suspension metadata key carrying the async task id
const TASK_ID_METADATA_KEY: &str = "taskId";

/// Durable record of a suspension, created when an instance pauses
///
/// Keyed by instance id with a secondary lookup by message id. Deleted on
/// resume (or when an async handler delivers its result).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspensionData {
    /// Unique message id for this suspension
    pub message_id: Uuid,

    /// Instance that suspended
    pub instance_id: String,

    /// Prompt surfaced to the caller
    pub prompt: StepOutput,

    /// Suspension metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// The input the suspended step originally received
    pub original_step_input: Option<StepOutput>,

    /// Type of the original input
    pub original_step_input_type: Option<TypeToken>,

    /// Step that suspended
    pub suspended_step_id: String,

    /// Expected type of the resumption input, when declared
    pub next_input: Option<TypeToken>,

    /// When the suspension was created
    pub created_at: DateTime<Utc>,
}

impl SuspensionData {
    /// Create a suspension record with a fresh message id
    pub fn new(
        instance_id: impl Into<String>,
        suspended_step_id: impl Into<String>,
        prompt: StepOutput,
    ) -> Self {
        Self {
            message_id: Uuid::now_v7(),
            instance_id: instance_id.into(),
            prompt,
            metadata: HashMap::new(),
            original_step_input: None,
            original_step_input_type: None,
            suspended_step_id: suspended_step_id.into(),
            next_input: None,
            created_at: Utc::now(),
        }
    }

    /// Use an explicit message id (shared with an async step state)
    pub fn with_message_id(mut self, message_id: Uuid) -> Self {
        self.message_id = message_id;
        self
    }

    /// Record the suspended step's original input
    pub fn with_original_input(mut self, input: Option<StepOutput>) -> Self {
        self.original_step_input_type =
            input.as_ref().and_then(|i| i.type_token().cloned());
        self.original_step_input = input;
        self
    }

    /// Declare the expected resumption input type
    pub fn with_next_input(mut self, token: TypeToken) -> Self {
        self.next_input = Some(token);
        self
    }

    /// Merge metadata entries
    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    /// Mark this suspension as async, driven by `task_id`
    pub fn mark_async(mut self, task_id: &str) -> Self {
        self.metadata
            .insert(ASYNC_METADATA_KEY.to_string(), "true".to_string());
        self.metadata
            .insert(TASK_ID_METADATA_KEY.to_string(), task_id.to_string());
        self
    }

    /// Whether this suspension is driven by an async task
    pub fn is_async(&self) -> bool {
        self.metadata.get(ASYNC_METADATA_KEY).map(String::as_str) == Some("true")
    }

    /// The async task id, for async suspensions
    pub fn task_id(&self) -> Option<&str> {
        self.metadata.get(TASK_ID_METADATA_KEY).map(String::as_str)
    }
}

/// Lifecycle of an async step execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsyncStepStatus {
    /// Handler is executing
    Running,

    /// Handler delivered its result
    Completed,

    /// Cancellation was requested
    Cancelled,

    /// Handler failed
    Failed,
}

impl AsyncStepStatus {
    /// Whether this status is terminal
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Durable state of an async step execution, keyed by message id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncStepState {
    /// Message id shared with the owning suspension
    pub message_id: Uuid,

    /// Task id the handler was selected for
    pub task_id: String,

    /// Progress percentage (0-100)
    pub percent_complete: u8,

    /// Last progress message
    pub status_message: Option<String>,

    /// Lifecycle status
    pub status: AsyncStepStatus,

    /// Output snapshot of the handler's final result
    pub result: Option<StepOutput>,

    /// Failure, when the handler failed
    pub error: Option<StepFailure>,

    /// When the async execution started
    pub created_at: DateTime<Utc>,

    /// Last mutation timestamp
    pub updated_at: DateTime<Utc>,
}

impl AsyncStepState {
    /// Create a fresh Running state at 0%
    pub fn new(message_id: Uuid, task_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            message_id,
            task_id: task_id.into(),
            percent_complete: 0,
            status_message: None,
            status: AsyncStepStatus::Running,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Durable key-value store of instance snapshots
///
/// `save` is total and atomic with respect to other `save`/`load` calls on
/// the same instance id; `load` returns the snapshot last saved. A save
/// following any state-changing transition happens-before any observer's
/// load of that instance.
#[async_trait]
pub trait StateRepository: Send + Sync + 'static {
    /// Persist an instance snapshot
    async fn save(&self, instance: &WorkflowInstance) -> Result<(), StoreError>;

    /// Load the last saved snapshot
    async fn load(&self, instance_id: &str) -> Result<Option<WorkflowInstance>, StoreError>;

    /// Remove a snapshot; returns whether one existed
    async fn delete(&self, instance_id: &str) -> Result<bool, StoreError>;

    /// All instances in a given status
    async fn find_by_status(
        &self,
        status: WorkflowStatus,
    ) -> Result<Vec<WorkflowInstance>, StoreError>;

    /// All instances of a workflow
    async fn find_by_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<WorkflowInstance>, StoreError>;

    /// All instances of a workflow in a given status
    async fn find_by_workflow_and_status(
        &self,
        workflow_id: &str,
        status: WorkflowStatus,
    ) -> Result<Vec<WorkflowInstance>, StoreError>;

    /// Count instances in a given status
    async fn count_by_status(&self, status: WorkflowStatus) -> Result<usize, StoreError>;

    /// Delete completed instances older than `age_days`; returns how many
    async fn delete_completed_older_than(&self, age_days: u32) -> Result<usize, StoreError>;
}

/// Store of suspension records, keyed by instance id with a secondary
/// index by message id
#[async_trait]
pub trait SuspensionDataRepository: Send + Sync + 'static {
    /// Persist a suspension record (replacing any prior one for the instance)
    async fn save(&self, data: &SuspensionData) -> Result<(), StoreError>;

    /// Find the suspension for an instance
    async fn find_by_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<SuspensionData>, StoreError>;

    /// Find a suspension by message id
    async fn find_by_message(
        &self,
        message_id: Uuid,
    ) -> Result<Option<SuspensionData>, StoreError>;

    /// Delete the suspension for an instance; returns whether one existed
    async fn delete(&self, instance_id: &str) -> Result<bool, StoreError>;
}

/// Store of async step state, keyed by message id
#[async_trait]
pub trait AsyncStepStateRepository: Send + Sync + 'static {
    /// Persist an async step state
    async fn save(&self, state: &AsyncStepState) -> Result<(), StoreError>;

    /// Load an async step state
    async fn find(&self, message_id: Uuid) -> Result<Option<AsyncStepState>, StoreError>;

    /// Delete an async step state; returns whether one existed
    async fn delete(&self, message_id: Uuid) -> Result<bool, StoreError>;

    /// Atomically update progress
    ///
    /// A negative `percent` preserves the current percentage; values above
    /// 100 are clamped. Returns the updated snapshot.
    async fn update_progress(
        &self,
        message_id: Uuid,
        percent: i32,
        message: Option<&str>,
    ) -> Result<AsyncStepState, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suspension_async_metadata() {
        let data = SuspensionData::new(
            "inst-1",
            "ocr-step",
            StepOutput::of(&"queued".to_string()).unwrap(),
        )
        .mark_async("ocr-123");

        assert!(data.is_async());
        assert_eq!(data.task_id(), Some("ocr-123"));
    }

    #[test]
    fn test_suspension_not_async_by_default() {
        let data = SuspensionData::new("inst-1", "ask", StepOutput::empty());
        assert!(!data.is_async());
        assert!(data.task_id().is_none());
    }

    #[test]
    fn test_original_input_captures_type() {
        let input = StepOutput::of(&5i64).unwrap();
        let data = SuspensionData::new("inst-1", "step", StepOutput::empty())
            .with_original_input(Some(input));

        assert_eq!(
            data.original_step_input_type,
            Some(TypeToken::of::<i64>())
        );
    }

    #[test]
    fn test_async_state_starts_running_at_zero() {
        let state = AsyncStepState::new(Uuid::now_v7(), "task-1");
        assert_eq!(state.status, AsyncStepStatus::Running);
        assert_eq!(state.percent_complete, 0);
        assert!(!state.status.is_terminal());
        assert!(AsyncStepStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_suspension_serde_round_trip() {
        let data = SuspensionData::new("inst-1", "step", StepOutput::of(&1i64).unwrap())
            .with_next_input(TypeToken::of::<String>())
            .mark_async("t-1");

        let json = serde_json::to_string(&data).unwrap();
        let back: SuspensionData = serde_json::from_str(&json).unwrap();

        assert_eq!(back.instance_id, "inst-1");
        assert_eq!(back.next_input, Some(TypeToken::of::<String>()));
        assert!(back.is_async());
    }
}
