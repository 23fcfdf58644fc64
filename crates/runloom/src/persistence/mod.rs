//! Durable state: repository contracts and in-memory reference stores

mod memory;
mod repository;

pub use memory::{
    InMemoryAsyncStepStateRepository, InMemoryStateRepository, InMemorySuspensionDataRepository,
    DEFAULT_STATE_CAPACITY,
};
pub use repository::{
    AsyncStepState, AsyncStepStateRepository, AsyncStepStatus, StateRepository, StoreError,
    SuspensionData, SuspensionDataRepository,
};
