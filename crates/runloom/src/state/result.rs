//! Step control outcomes
//!
//! Every step resolves to a [`StepResult`]: the closed sum the orchestrator
//! dispatches on. Consumers match exhaustively; there is no catch-all.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use super::context::ASYNC_FUTURE_KEY;
use super::failure::StepFailure;
use super::output::{StateError, StepOutput, TypeToken};

/// Routing marker selecting an outgoing branch edge
///
/// A branch event is routing data, never data flow: the orchestrator uses it
/// to pick an edge and does not store it as a step output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchEvent {
    marker: TypeToken,
    value: Option<serde_json::Value>,
}

impl BranchEvent {
    /// Marker selecting a `BranchOnType` edge by the event's type
    pub fn of<E: Serialize + 'static>(event: &E) -> Result<Self, StateError> {
        let _ = serde_json::to_value(event)
            .map_err(|e| StateError::Serialization(e.to_string()))?;
        Ok(Self {
            marker: TypeToken::of::<E>(),
            value: None,
        })
    }

    /// Marker selecting a `BranchOnValue` edge by type and value
    pub fn with_value<E: Serialize + 'static>(value: &E) -> Result<Self, StateError> {
        let json = serde_json::to_value(value)
            .map_err(|e| StateError::Serialization(e.to_string()))?;
        Ok(Self {
            marker: TypeToken::of::<E>(),
            value: Some(json),
        })
    }

    /// The marker type token
    pub fn marker(&self) -> &TypeToken {
        &self.marker
    }

    /// The marker value, when this event targets value edges
    pub fn value(&self) -> Option<&serde_json::Value> {
        self.value.as_ref()
    }
}

/// Outcome of an attached future (the future-based async variant)
pub enum AsyncOutcome {
    /// A full step result, used directly
    Result(Box<StepResult>),

    /// A plain value: wrapped `Finish` when the step has no outgoing
    /// sequential edges, `Continue` otherwise
    Value(StepOutput),
}

/// Future attached to an `Async` outcome in place of a registered handler
pub type AttachedFuture =
    Pin<Box<dyn Future<Output = Result<AsyncOutcome, StepFailure>> + Send>>;

/// Control outcome produced by a step
pub enum StepResult {
    /// Proceed with `data` as the next step's input
    Continue {
        /// The produced value
        data: StepOutput,
    },

    /// Pause the instance until external input arrives
    Suspend {
        /// Prompt surfaced to the caller (required)
        prompt: StepOutput,

        /// Expected type of the resumption input (required)
        next_input: TypeToken,

        /// Optional JSON schema for the resumption input
        next_input_schema: Option<serde_json::Value>,

        /// Suspension metadata
        metadata: HashMap<String, String>,
    },

    /// Routing marker; the event selects the outgoing branch edge
    Branch {
        /// The routing event
        event: BranchEvent,
    },

    /// Terminal success
    Finish {
        /// The final result
        data: StepOutput,
    },

    /// Terminal failure (error required)
    Fail {
        /// The failure
        error: StepFailure,
    },

    /// Execute a handler asynchronously under `task_id`
    Async {
        /// Task identifier, matched against the graph's handler patterns
        task_id: String,

        /// Estimated duration in milliseconds (informational)
        estimated_ms: u64,

        /// Arguments handed to the handler
        task_args: HashMap<String, serde_json::Value>,

        /// Value surfaced to observers immediately
        immediate: StepOutput,

        /// Future to await instead of a registered handler
        attached: Option<AttachedFuture>,
    },
}

impl StepResult {
    /// Proceed with a value
    pub fn next<T: Serialize + 'static>(value: T) -> Result<Self, StateError> {
        Ok(Self::Continue {
            data: StepOutput::of(&value)?,
        })
    }

    /// Finish the workflow with a final result
    pub fn finish<T: Serialize + 'static>(value: T) -> Result<Self, StateError> {
        Ok(Self::Finish {
            data: StepOutput::of(&value)?,
        })
    }

    /// Finish with no value (used by the invocation-limit STOP behavior)
    pub fn finish_empty() -> Self {
        Self::Finish {
            data: StepOutput::empty(),
        }
    }

    /// Suspend, expecting a resumption input of type `I`
    pub fn suspend<I: 'static>(prompt: impl Into<String>) -> Result<Self, StateError> {
        Ok(Self::Suspend {
            prompt: StepOutput::of(&prompt.into())?,
            next_input: TypeToken::of::<I>(),
            next_input_schema: None,
            metadata: HashMap::new(),
        })
    }

    /// Suspend with an explicit schema and metadata
    pub fn suspend_with(
        prompt: impl Into<String>,
        next_input: TypeToken,
        next_input_schema: Option<serde_json::Value>,
        metadata: HashMap<String, String>,
    ) -> Result<Self, StateError> {
        Ok(Self::Suspend {
            prompt: StepOutput::of(&prompt.into())?,
            next_input,
            next_input_schema,
            metadata,
        })
    }

    /// Branch on the event's type
    pub fn branch<E: Serialize + 'static>(event: &E) -> Result<Self, StateError> {
        Ok(Self::Branch {
            event: BranchEvent::of(event)?,
        })
    }

    /// Branch on the event's type and value
    pub fn branch_on_value<E: Serialize + 'static>(value: &E) -> Result<Self, StateError> {
        Ok(Self::Branch {
            event: BranchEvent::with_value(value)?,
        })
    }

    /// Fail the workflow
    pub fn fail(error: impl Into<StepFailure>) -> Self {
        Self::Fail {
            error: error.into(),
        }
    }

    /// Run the handler registered for `task_id` asynchronously
    pub fn run_async<T: Serialize + 'static>(
        task_id: impl Into<String>,
        estimated_ms: u64,
        task_args: HashMap<String, serde_json::Value>,
        immediate: T,
    ) -> Result<Self, StateError> {
        Ok(Self::Async {
            task_id: task_id.into(),
            estimated_ms,
            task_args,
            immediate: StepOutput::of(&immediate)?,
            attached: None,
        })
    }

    /// Attach a future in place of a registered handler
    pub fn attach_future<T, F>(
        task_id: impl Into<String>,
        estimated_ms: u64,
        immediate: T,
        future: F,
    ) -> Result<Self, StateError>
    where
        T: Serialize + 'static,
        F: Future<Output = Result<AsyncOutcome, StepFailure>> + Send + 'static,
    {
        let mut task_args = HashMap::new();
        task_args.insert(ASYNC_FUTURE_KEY.to_string(), serde_json::Value::Bool(true));
        Ok(Self::Async {
            task_id: task_id.into(),
            estimated_ms,
            task_args,
            immediate: StepOutput::of(&immediate)?,
            attached: Some(Box::pin(future)),
        })
    }

    /// Short variant name (for logs and history)
    pub fn variant(&self) -> &'static str {
        match self {
            Self::Continue { .. } => "continue",
            Self::Suspend { .. } => "suspend",
            Self::Branch { .. } => "branch",
            Self::Finish { .. } => "finish",
            Self::Fail { .. } => "fail",
            Self::Async { .. } => "async",
        }
    }

    /// The output recorded in history for this result, if any
    pub fn output_snapshot(&self) -> Option<StepOutput> {
        match self {
            Self::Continue { data } | Self::Finish { data } => Some(data.clone()),
            Self::Suspend { prompt, .. } => Some(prompt.clone()),
            Self::Async { immediate, .. } => Some(immediate.clone()),
            Self::Branch { .. } | Self::Fail { .. } => None,
        }
    }
}

impl std::fmt::Debug for StepResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continue { data } => f.debug_struct("Continue").field("data", data).finish(),
            Self::Suspend {
                prompt, next_input, ..
            } => f
                .debug_struct("Suspend")
                .field("prompt", prompt)
                .field("next_input", next_input)
                .finish(),
            Self::Branch { event } => f.debug_struct("Branch").field("event", event).finish(),
            Self::Finish { data } => f.debug_struct("Finish").field("data", data).finish(),
            Self::Fail { error } => f.debug_struct("Fail").field("error", error).finish(),
            Self::Async {
                task_id,
                estimated_ms,
                attached,
                ..
            } => f
                .debug_struct("Async")
                .field("task_id", task_id)
                .field("estimated_ms", estimated_ms)
                .field("attached", &attached.is_some())
                .finish(),
        }
    }
}
