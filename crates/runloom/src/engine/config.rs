//! Engine configuration

use crate::persistence::DEFAULT_STATE_CAPACITY;
use crate::reliability::CircuitBreakerConfig;
use crate::worker::WorkerPoolConfig;

/// Configuration for the workflow engine
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Worker pool sizing and shutdown behavior
    pub worker_pool: WorkerPoolConfig,

    /// Capacity of the default in-memory state repository
    pub state_capacity: usize,

    /// Circuit breaker thresholds applied per step
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_pool: WorkerPoolConfig::default(),
            state_capacity: DEFAULT_STATE_CAPACITY,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker pool configuration
    pub fn with_worker_pool(mut self, config: WorkerPoolConfig) -> Self {
        self.worker_pool = config;
        self
    }

    /// Set the default in-memory repository capacity
    pub fn with_state_capacity(mut self, capacity: usize) -> Self {
        self.state_capacity = capacity.max(1);
        self
    }

    /// Set the per-step circuit breaker configuration
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }
}
