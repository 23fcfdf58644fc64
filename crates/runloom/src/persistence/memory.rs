//! In-memory repository implementations
//!
//! Reference implementations backing tests and embedded deployments. All
//! data lives behind `parking_lot` locks; reads hand out clones so callers
//! can never mutate stored state in place.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::state::{WorkflowInstance, WorkflowStatus};

use super::repository::{
    AsyncStepState, AsyncStepStateRepository, StateRepository, StoreError, SuspensionData,
    SuspensionDataRepository,
};

/// Default instance capacity for the in-memory state repository
pub const DEFAULT_STATE_CAPACITY: usize = 10_000;

/// In-memory instance snapshot store with bounded capacity
///
/// When the capacity is reached, the oldest terminal instance is evicted;
/// if none are terminal, the oldest live instance is evicted with a
/// warning.
///
/// # Example
///
/// ```
/// use runloom::persistence::InMemoryStateRepository;
///
/// let repo = InMemoryStateRepository::with_capacity(100);
/// assert!(repo.is_empty());
/// ```
pub struct InMemoryStateRepository {
    instances: RwLock<HashMap<String, WorkflowInstance>>,
    capacity: usize,
}

impl InMemoryStateRepository {
    /// Create a store with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_STATE_CAPACITY)
    }

    /// Create a store with an explicit capacity (min 1)
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Number of stored instances
    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.instances.write().clear();
    }

    fn evict_one(instances: &mut HashMap<String, WorkflowInstance>) {
        let oldest_terminal = instances
            .values()
            .filter(|i| i.is_terminal())
            .min_by_key(|i| i.created_at)
            .map(|i| i.instance_id.clone());

        let victim = match oldest_terminal {
            Some(id) => id,
            None => {
                let oldest = instances
                    .values()
                    .min_by_key(|i| i.created_at)
                    .map(|i| i.instance_id.clone());
                match oldest {
                    Some(id) => {
                        warn!(
                            instance_id = %id,
                            "state repository full, evicting a live instance"
                        );
                        id
                    }
                    None => return,
                }
            }
        };

        instances.remove(&victim);
    }
}

impl Default for InMemoryStateRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateRepository for InMemoryStateRepository {
    async fn save(&self, instance: &WorkflowInstance) -> Result<(), StoreError> {
        let mut instances = self.instances.write();
        if !instances.contains_key(&instance.instance_id) && instances.len() >= self.capacity {
            Self::evict_one(&mut instances);
        }
        instances.insert(instance.instance_id.clone(), instance.clone());
        Ok(())
    }

    async fn load(&self, instance_id: &str) -> Result<Option<WorkflowInstance>, StoreError> {
        Ok(self.instances.read().get(instance_id).cloned())
    }

    async fn delete(&self, instance_id: &str) -> Result<bool, StoreError> {
        Ok(self.instances.write().remove(instance_id).is_some())
    }

    async fn find_by_status(
        &self,
        status: WorkflowStatus,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        Ok(self
            .instances
            .read()
            .values()
            .filter(|i| i.status == status)
            .cloned()
            .collect())
    }

    async fn find_by_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        Ok(self
            .instances
            .read()
            .values()
            .filter(|i| i.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn find_by_workflow_and_status(
        &self,
        workflow_id: &str,
        status: WorkflowStatus,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        Ok(self
            .instances
            .read()
            .values()
            .filter(|i| i.workflow_id == workflow_id && i.status == status)
            .cloned()
            .collect())
    }

    async fn count_by_status(&self, status: WorkflowStatus) -> Result<usize, StoreError> {
        Ok(self
            .instances
            .read()
            .values()
            .filter(|i| i.status == status)
            .count())
    }

    async fn delete_completed_older_than(&self, age_days: u32) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - ChronoDuration::days(age_days as i64);
        let mut instances = self.instances.write();
        let before = instances.len();
        instances.retain(|_, i| {
            !(i.status == WorkflowStatus::Completed
                && i.completed_at.map(|t| t < cutoff).unwrap_or(false))
        });
        Ok(before - instances.len())
    }
}

/// Internal state of the suspension store: primary map plus message index
#[derive(Default)]
struct SuspensionMaps {
    by_instance: HashMap<String, SuspensionData>,
    by_message: HashMap<Uuid, String>,
}

/// In-memory suspension record store
pub struct InMemorySuspensionDataRepository {
    maps: RwLock<SuspensionMaps>,
}

impl InMemorySuspensionDataRepository {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            maps: RwLock::new(SuspensionMaps::default()),
        }
    }

    /// Number of stored suspensions
    pub fn len(&self) -> usize {
        self.maps.read().by_instance.len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.maps.read().by_instance.is_empty()
    }
}

impl Default for InMemorySuspensionDataRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SuspensionDataRepository for InMemorySuspensionDataRepository {
    async fn save(&self, data: &SuspensionData) -> Result<(), StoreError> {
        let mut maps = self.maps.write();
        if let Some(prior) = maps.by_instance.insert(data.instance_id.clone(), data.clone()) {
            maps.by_message.remove(&prior.message_id);
        }
        maps.by_message
            .insert(data.message_id, data.instance_id.clone());
        Ok(())
    }

    async fn find_by_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<SuspensionData>, StoreError> {
        Ok(self.maps.read().by_instance.get(instance_id).cloned())
    }

    async fn find_by_message(
        &self,
        message_id: Uuid,
    ) -> Result<Option<SuspensionData>, StoreError> {
        let maps = self.maps.read();
        Ok(maps
            .by_message
            .get(&message_id)
            .and_then(|id| maps.by_instance.get(id))
            .cloned())
    }

    async fn delete(&self, instance_id: &str) -> Result<bool, StoreError> {
        let mut maps = self.maps.write();
        match maps.by_instance.remove(instance_id) {
            Some(data) => {
                maps.by_message.remove(&data.message_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// In-memory async step state store
pub struct InMemoryAsyncStepStateRepository {
    states: RwLock<HashMap<Uuid, AsyncStepState>>,
}

impl InMemoryAsyncStepStateRepository {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored states
    pub fn len(&self) -> usize {
        self.states.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.states.read().is_empty()
    }
}

impl Default for InMemoryAsyncStepStateRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AsyncStepStateRepository for InMemoryAsyncStepStateRepository {
    async fn save(&self, state: &AsyncStepState) -> Result<(), StoreError> {
        self.states
            .write()
            .insert(state.message_id, state.clone());
        Ok(())
    }

    async fn find(&self, message_id: Uuid) -> Result<Option<AsyncStepState>, StoreError> {
        Ok(self.states.read().get(&message_id).cloned())
    }

    async fn delete(&self, message_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.states.write().remove(&message_id).is_some())
    }

    async fn update_progress(
        &self,
        message_id: Uuid,
        percent: i32,
        message: Option<&str>,
    ) -> Result<AsyncStepState, StoreError> {
        let mut states = self.states.write();
        let state = states
            .get_mut(&message_id)
            .ok_or_else(|| StoreError::NotFound(message_id.to_string()))?;

        if percent >= 0 {
            state.percent_complete = percent.min(100) as u8;
        }
        if let Some(msg) = message {
            state.status_message = Some(msg.to_string());
        }
        state.updated_at = Utc::now();
        Ok(state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{StepOutput, WorkflowContext};

    fn instance(id: &str, workflow: &str) -> WorkflowInstance {
        let ctx = WorkflowContext::new(id, StepOutput::of(&0i64).unwrap());
        WorkflowInstance::new(workflow, "1.0", ctx, "start")
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let repo = InMemoryStateRepository::new();
        let inst = instance("i-1", "wf");

        repo.save(&inst).await.unwrap();
        let loaded = repo.load("i-1").await.unwrap().unwrap();

        assert_eq!(loaded.instance_id, "i-1");
        assert_eq!(loaded.workflow_id, "wf");
        assert!(repo.load("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_loads_are_defensive_copies() {
        let repo = InMemoryStateRepository::new();
        repo.save(&instance("i-1", "wf")).await.unwrap();

        let mut loaded = repo.load("i-1").await.unwrap().unwrap();
        loaded.workflow_id = "mutated".to_string();

        let reloaded = repo.load("i-1").await.unwrap().unwrap();
        assert_eq!(reloaded.workflow_id, "wf");
    }

    #[tokio::test]
    async fn test_find_and_count_by_status() {
        let repo = InMemoryStateRepository::new();
        let mut done = instance("i-done", "wf");
        done.try_transition(WorkflowStatus::Completed);

        repo.save(&instance("i-run", "wf")).await.unwrap();
        repo.save(&done).await.unwrap();

        let running = repo.find_by_status(WorkflowStatus::Running).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(
            repo.count_by_status(WorkflowStatus::Completed).await.unwrap(),
            1
        );

        let scoped = repo
            .find_by_workflow_and_status("wf", WorkflowStatus::Running)
            .await
            .unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].instance_id, "i-run");
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest_terminal_first() {
        let repo = InMemoryStateRepository::with_capacity(2);

        let mut old_done = instance("i-old", "wf");
        old_done.try_transition(WorkflowStatus::Completed);
        repo.save(&old_done).await.unwrap();
        repo.save(&instance("i-live", "wf")).await.unwrap();

        // third insert exceeds capacity; the terminal instance goes first
        repo.save(&instance("i-new", "wf")).await.unwrap();

        assert_eq!(repo.len(), 2);
        assert!(repo.load("i-old").await.unwrap().is_none());
        assert!(repo.load("i-live").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_capacity_evicts_live_when_no_terminal() {
        let repo = InMemoryStateRepository::with_capacity(1);
        repo.save(&instance("i-1", "wf")).await.unwrap();
        repo.save(&instance("i-2", "wf")).await.unwrap();

        assert_eq!(repo.len(), 1);
        assert!(repo.load("i-2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_completed_older_than() {
        let repo = InMemoryStateRepository::new();
        let mut done = instance("i-done", "wf");
        done.try_transition(WorkflowStatus::Completed);
        done.completed_at = Some(Utc::now() - ChronoDuration::days(10));
        repo.save(&done).await.unwrap();
        repo.save(&instance("i-live", "wf")).await.unwrap();

        let removed = repo.delete_completed_older_than(7).await.unwrap();
        assert_eq!(removed, 1);
        assert!(repo.load("i-done").await.unwrap().is_none());
        assert!(repo.load("i-live").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_suspension_secondary_index() {
        let repo = InMemorySuspensionDataRepository::new();
        let data = SuspensionData::new("i-1", "ask", StepOutput::of(&"hi".to_string()).unwrap());
        let message_id = data.message_id;

        repo.save(&data).await.unwrap();

        let by_instance = repo.find_by_instance("i-1").await.unwrap().unwrap();
        assert_eq!(by_instance.message_id, message_id);

        let by_message = repo.find_by_message(message_id).await.unwrap().unwrap();
        assert_eq!(by_message.instance_id, "i-1");

        assert!(repo.delete("i-1").await.unwrap());
        assert!(repo.find_by_message(message_id).await.unwrap().is_none());
        assert!(!repo.delete("i-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_resaving_suspension_drops_stale_message_index() {
        let repo = InMemorySuspensionDataRepository::new();
        let first = SuspensionData::new("i-1", "ask", StepOutput::empty());
        let stale_message = first.message_id;
        repo.save(&first).await.unwrap();

        let second = SuspensionData::new("i-1", "ask-again", StepOutput::empty());
        repo.save(&second).await.unwrap();

        assert!(repo.find_by_message(stale_message).await.unwrap().is_none());
        assert!(repo
            .find_by_message(second.message_id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_async_progress_updates() {
        let repo = InMemoryAsyncStepStateRepository::new();
        let state = AsyncStepState::new(Uuid::now_v7(), "ocr-1");
        let id = state.message_id;
        repo.save(&state).await.unwrap();

        let updated = repo.update_progress(id, 50, Some("halfway")).await.unwrap();
        assert_eq!(updated.percent_complete, 50);
        assert_eq!(updated.status_message.as_deref(), Some("halfway"));

        // negative percent preserves the current value
        let updated = repo.update_progress(id, -1, Some("still going")).await.unwrap();
        assert_eq!(updated.percent_complete, 50);
        assert_eq!(updated.status_message.as_deref(), Some("still going"));

        // values above 100 are clamped
        let updated = repo.update_progress(id, 250, None).await.unwrap();
        assert_eq!(updated.percent_complete, 100);
    }

    #[tokio::test]
    async fn test_async_progress_missing_state() {
        let repo = InMemoryAsyncStepStateRepository::new();
        let result = repo.update_progress(Uuid::now_v7(), 10, None).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }
}
