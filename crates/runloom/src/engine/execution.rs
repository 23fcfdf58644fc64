//! Execution handles and completion plumbing

use std::marker::PhantomData;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;

use crate::state::{ErrorInfo, StepOutput, WorkflowStatus};

use super::error::EngineError;

type CompletionResult = Result<StepOutput, ErrorInfo>;

/// One completion channel per live instance
///
/// The sender stays parked across suspensions: the outer future only
/// completes on a terminal transition. Registering again (on resume)
/// replaces the old channel; a superseded receiver resolves with
/// [`EngineError::Detached`].
#[derive(Default)]
pub(crate) struct CompletionHub {
    senders: DashMap<String, oneshot::Sender<CompletionResult>>,
}

impl CompletionHub {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Open (or replace) the completion channel for an instance
    pub(crate) fn register(&self, instance_id: &str) -> oneshot::Receiver<CompletionResult> {
        let (tx, rx) = oneshot::channel();
        self.senders.insert(instance_id.to_string(), tx);
        rx
    }

    /// Complete the instance's future successfully (at most once)
    pub(crate) fn complete_ok(&self, instance_id: &str, output: StepOutput) {
        if let Some((_, tx)) = self.senders.remove(instance_id) {
            let _ = tx.send(Ok(output));
        }
    }

    /// Complete the instance's future exceptionally (at most once)
    pub(crate) fn complete_err(&self, instance_id: &str, error: ErrorInfo) {
        if let Some((_, tx)) = self.senders.remove(instance_id) {
            let _ = tx.send(Err(error));
        }
    }

}

/// Handle to a running workflow instance
///
/// Resolves with the workflow's final result on completion, or with the
/// failure record on failure. On suspension it stays pending; observe
/// `Suspended` through the engine's query surface and resume to get a
/// fresh handle.
#[derive(Debug)]
pub struct Execution<R> {
    instance_id: String,
    rx: oneshot::Receiver<CompletionResult>,
    _result: PhantomData<fn() -> R>,
}

impl<R: DeserializeOwned + 'static> Execution<R> {
    pub(crate) fn new(instance_id: String, rx: oneshot::Receiver<CompletionResult>) -> Self {
        Self {
            instance_id,
            rx,
            _result: PhantomData,
        }
    }

    /// The instance this handle observes
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Await the workflow's terminal outcome
    pub async fn result(self) -> Result<R, EngineError> {
        match self.rx.await {
            Ok(Ok(output)) => output.value::<R>().map_err(EngineError::from),
            Ok(Err(error)) => Err(EngineError::WorkflowFailed(error)),
            Err(_) => Err(EngineError::Detached),
        }
    }
}

/// Observer snapshot of an instance's progress
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    /// Instance status at snapshot time
    pub status: WorkflowStatus,

    /// Progress percentage: async progress while one is in flight,
    /// otherwise 0 for live instances and 100 for terminal ones
    pub percent: u8,

    /// Async status message, or the suspension prompt
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completes_ok_once() {
        let hub = CompletionHub::new();
        let rx = hub.register("i-1");
        hub.complete_ok("i-1", StepOutput::of(&"done".to_string()).unwrap());
        // second completion is a no-op
        hub.complete_err("i-1", ErrorInfo::new(crate::state::ErrorKind::Internal, "late"));

        let execution: Execution<String> = Execution::new("i-1".to_string(), rx);
        assert_eq!(execution.result().await.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_completes_err() {
        let hub = CompletionHub::new();
        let rx = hub.register("i-1");
        hub.complete_err(
            "i-1",
            ErrorInfo::new(crate::state::ErrorKind::RoutingFailure, "no next step"),
        );

        let execution: Execution<String> = Execution::new("i-1".to_string(), rx);
        match execution.result().await {
            Err(EngineError::WorkflowFailed(info)) => {
                assert_eq!(info.kind, crate::state::ErrorKind::RoutingFailure);
            }
            other => panic!("expected WorkflowFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_superseded_handle_detaches() {
        let hub = CompletionHub::new();
        let old_rx = hub.register("i-1");
        let _new_rx = hub.register("i-1");

        let execution: Execution<String> = Execution::new("i-1".to_string(), old_rx);
        assert!(matches!(execution.result().await, Err(EngineError::Detached)));
    }
}
