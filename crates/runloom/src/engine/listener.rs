//! Workflow lifecycle listeners

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::warn;

use crate::state::{ErrorInfo, StepFailure, WorkflowInstance};

/// Observer of workflow and step lifecycle events
///
/// Listener failures are logged and swallowed; they never change workflow
/// outcomes.
#[async_trait]
pub trait WorkflowListener: Send + Sync {
    /// A fresh instance started executing
    async fn on_workflow_started(&self, _instance: &WorkflowInstance) -> anyhow::Result<()> {
        Ok(())
    }

    /// An instance suspended
    async fn on_workflow_suspended(&self, _instance: &WorkflowInstance) -> anyhow::Result<()> {
        Ok(())
    }

    /// A suspended instance resumed
    async fn on_workflow_resumed(&self, _instance: &WorkflowInstance) -> anyhow::Result<()> {
        Ok(())
    }

    /// An instance completed successfully
    async fn on_workflow_completed(&self, _instance: &WorkflowInstance) -> anyhow::Result<()> {
        Ok(())
    }

    /// An instance failed
    async fn on_workflow_failed(
        &self,
        _instance: &WorkflowInstance,
        _error: &ErrorInfo,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// An instance was cancelled
    async fn on_workflow_cancelled(&self, _instance: &WorkflowInstance) -> anyhow::Result<()> {
        Ok(())
    }

    /// A step is about to execute
    async fn on_step_started(
        &self,
        _instance: &WorkflowInstance,
        _step_id: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// A step produced a result
    async fn on_step_completed(
        &self,
        _instance: &WorkflowInstance,
        _step_id: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// A step failed
    async fn on_step_failed(
        &self,
        _instance: &WorkflowInstance,
        _step_id: &str,
        _error: &StepFailure,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Keyed set of workflow listeners with isolated notification
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<HashMap<String, Arc<dyn WorkflowListener>>>,
}

macro_rules! notify {
    ($name:ident, $($arg:ident : $ty:ty),*) => {
        pub(crate) async fn $name(&self, $($arg: $ty),*) {
            for (id, listener) in self.snapshot() {
                if let Err(e) = listener.$name($($arg),*).await {
                    warn!(listener = %id, error = %e, "workflow listener failed");
                }
            }
        }
    };
}

impl ListenerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a listener under an id
    pub fn add(&self, id: impl Into<String>, listener: Arc<dyn WorkflowListener>) {
        self.listeners.write().insert(id.into(), listener);
    }

    /// Remove a listener; returns whether one was registered
    pub fn remove(&self, id: &str) -> bool {
        self.listeners.write().remove(id).is_some()
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    fn snapshot(&self) -> Vec<(String, Arc<dyn WorkflowListener>)> {
        self.listeners
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    notify!(on_workflow_started, instance: &WorkflowInstance);
    notify!(on_workflow_suspended, instance: &WorkflowInstance);
    notify!(on_workflow_resumed, instance: &WorkflowInstance);
    notify!(on_workflow_completed, instance: &WorkflowInstance);
    notify!(on_workflow_failed, instance: &WorkflowInstance, error: &ErrorInfo);
    notify!(on_workflow_cancelled, instance: &WorkflowInstance);
    notify!(on_step_started, instance: &WorkflowInstance, step_id: &str);
    notify!(on_step_completed, instance: &WorkflowInstance, step_id: &str);
    notify!(on_step_failed, instance: &WorkflowInstance, step_id: &str, error: &StepFailure);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{StepOutput, WorkflowContext};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener {
        started: AtomicUsize,
    }

    #[async_trait]
    impl WorkflowListener for CountingListener {
        async fn on_workflow_started(&self, _instance: &WorkflowInstance) -> anyhow::Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct PanickyListener;

    #[async_trait]
    impl WorkflowListener for PanickyListener {
        async fn on_workflow_started(&self, _instance: &WorkflowInstance) -> anyhow::Result<()> {
            anyhow::bail!("listener blew up")
        }
    }

    fn instance() -> WorkflowInstance {
        let ctx = WorkflowContext::new("r", StepOutput::empty());
        WorkflowInstance::new("wf", "1.0", ctx, "s")
    }

    #[tokio::test]
    async fn test_add_remove() {
        let registry = ListenerRegistry::new();
        registry.add("a", Arc::new(PanickyListener));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove("a"));
        assert!(!registry.remove("a"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let registry = ListenerRegistry::new();
        let counting = Arc::new(CountingListener {
            started: AtomicUsize::new(0),
        });
        registry.add("boom", Arc::new(PanickyListener));
        registry.add("count", counting.clone());

        registry.on_workflow_started(&instance()).await;

        assert_eq!(counting.started.load(Ordering::SeqCst), 1);
    }
}
