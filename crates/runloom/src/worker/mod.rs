//! Bounded worker pool
//!
//! Workflow instances and async handlers run on a semaphore-bounded pool.
//! When every permit is taken the submitting task runs the work itself
//! (caller-runs overflow), so load sheds onto producers instead of growing
//! an unbounded queue. Shutdown drains active work up to a grace period.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerPoolConfig {
    /// Maximum concurrent tasks on pool workers
    pub max_concurrency: usize,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum concurrency (clamped to ≥ 1)
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Set the graceful shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Accepting and executing tasks
    Running,

    /// Draining: finishing current tasks
    Draining,

    /// Stopped
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// Active tasks outlived the shutdown grace period
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Semaphore-bounded task pool with caller-runs overflow
///
/// # Example
///
/// ```
/// use runloom::worker::{WorkerPool, WorkerPoolConfig};
///
/// # tokio_test::block_on(async {
/// let pool = WorkerPool::new(WorkerPoolConfig::new().with_max_concurrency(4));
/// pool.spawn(async { /* work */ }).await;
/// pool.shutdown().await.unwrap();
/// # });
/// ```
pub struct WorkerPool {
    config: WorkerPoolConfig,
    permits: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
    status: parking_lot::RwLock<WorkerPoolStatus>,
}

impl WorkerPool {
    /// Create a pool
    pub fn new(config: WorkerPoolConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrency)),
            config,
            shutdown_tx,
            status: parking_lot::RwLock::new(WorkerPoolStatus::Running),
        }
    }

    /// Submit a task
    ///
    /// Runs on a pool worker when a permit is available; otherwise the task
    /// executes on the submitting task before this call returns.
    pub async fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => {
                tokio::spawn(async move {
                    task.await;
                    drop(permit);
                });
            }
            Err(_) => {
                debug!("worker pool saturated, running task on caller");
                task.await;
            }
        }
    }

    /// Current number of tasks running on pool workers
    pub fn current_load(&self) -> usize {
        self.config.max_concurrency - self.permits.available_permits()
    }

    /// Current status
    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    /// Drain active tasks and stop
    ///
    /// Waits up to the configured grace period for workers to finish.
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status == WorkerPoolStatus::Stopped {
                return Ok(());
            }
            *status = WorkerPoolStatus::Draining;
        }
        let _ = self.shutdown_tx.send(true);
        info!("worker pool draining");

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            if self.permits.available_permits() == self.config.max_concurrency {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = self.current_load(),
                    "worker pool shutdown timed out"
                );
                return Err(WorkerPoolError::ShutdownTimeout);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        *self.status.write() = WorkerPoolStatus::Stopped;
        info!("worker pool stopped");
        Ok(())
    }

    /// Subscribe to the shutdown signal
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
