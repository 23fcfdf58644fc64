//! Instance state: typed outputs, control outcomes, context, snapshots

mod context;
mod failure;
mod instance;
mod output;
mod result;

pub use context::{
    WorkflowContext, ASYNC_FUTURE_KEY, FINAL_OUTPUT_KEY, RESUMED_STEP_INPUT_KEY, USER_INPUT_KEY,
    USER_INPUT_TYPE_KEY,
};
pub use failure::{ErrorInfo, ErrorKind, FailureCause, StepFailure};
pub use instance::{ExecutionRecord, WorkflowInstance, WorkflowStatus};
pub use output::{StateError, StepOutput, TypeToken};
pub use result::{AsyncOutcome, AttachedFuture, BranchEvent, StepResult};
