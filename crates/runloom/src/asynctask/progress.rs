//! Progress reporting for async steps

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::persistence::{AsyncStepState, AsyncStepStateRepository, AsyncStepStatus, StoreError};

/// In-memory progress snapshot of one async task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskProgress {
    /// Message id of the owning suspension
    pub message_id: Uuid,

    /// Task id the handler runs under
    pub task_id: String,

    /// Progress percentage (0-100)
    pub percent: u8,

    /// Last progress message
    pub message: Option<String>,

    /// Lifecycle status
    pub status: AsyncStepStatus,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

/// In-memory mirror of async progress for cheap observer queries
///
/// The durable source of truth is the [`AsyncStepStateRepository`]; the
/// tracker mirrors every persisted update so progress snapshots never touch
/// the store on the read path.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    entries: DashMap<Uuid, TaskProgress>,
}

impl ProgressTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirror a persisted async state
    pub fn record(&self, state: &AsyncStepState) {
        self.entries.insert(
            state.message_id,
            TaskProgress {
                message_id: state.message_id,
                task_id: state.task_id.clone(),
                percent: state.percent_complete,
                message: state.status_message.clone(),
                status: state.status,
                updated_at: state.updated_at,
            },
        );
    }

    /// Current snapshot for a message id
    pub fn get(&self, message_id: Uuid) -> Option<TaskProgress> {
        self.entries.get(&message_id).map(|e| e.clone())
    }

    /// Drop a snapshot
    pub fn remove(&self, message_id: Uuid) {
        self.entries.remove(&message_id);
    }

    /// Number of tracked tasks
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Handle given to async handlers for progress updates and cancellation
/// checks
///
/// Updates are persisted to the async step state and mirrored into the
/// [`ProgressTracker`] atomically with respect to other updates for the
/// same message id.
#[derive(Clone)]
pub struct ProgressReporter {
    message_id: Uuid,
    repo: Option<Arc<dyn AsyncStepStateRepository>>,
    tracker: Option<Arc<ProgressTracker>>,
    cancel: CancellationToken,
}

impl ProgressReporter {
    pub(crate) fn new(
        message_id: Uuid,
        repo: Arc<dyn AsyncStepStateRepository>,
        tracker: Arc<ProgressTracker>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            message_id,
            repo: Some(repo),
            tracker: Some(tracker),
            cancel,
        }
    }

    /// A reporter wired to nothing (for tests and detached handler runs)
    pub fn detached() -> Self {
        Self {
            message_id: Uuid::now_v7(),
            repo: None,
            tracker: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Message id of the owning suspension
    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    /// Report progress
    ///
    /// A negative `percent` preserves the current percentage and only
    /// updates the message.
    pub async fn update_progress(
        &self,
        percent: i32,
        message: impl Into<String>,
    ) -> Result<(), StoreError> {
        let message = message.into();
        if let Some(repo) = &self.repo {
            let state = self
                .repo_update(repo, percent, &message)
                .await?;
            if let Some(tracker) = &self.tracker {
                tracker.record(&state);
            }
        }
        Ok(())
    }

    async fn repo_update(
        &self,
        repo: &Arc<dyn AsyncStepStateRepository>,
        percent: i32,
        message: &str,
    ) -> Result<AsyncStepState, StoreError> {
        match repo.update_progress(self.message_id, percent, Some(message)).await {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!(message_id = %self.message_id, error = %e, "progress update failed");
                Err(e)
            }
        }
    }

    /// Whether cancellation was requested
    ///
    /// Handlers are expected to poll this and exit promptly once it turns
    /// true.
    pub async fn is_cancelled(&self) -> bool {
        if self.cancel.is_cancelled() {
            return true;
        }
        if let Some(repo) = &self.repo {
            return matches!(
                repo.find(self.message_id).await,
                Ok(Some(state)) if state.status == AsyncStepStatus::Cancelled
            );
        }
        false
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("message_id", &self.message_id)
            .field("wired", &self.repo.is_some())
            .finish()
    }
}
