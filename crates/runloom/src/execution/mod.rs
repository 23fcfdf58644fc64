//! Step execution: single-shot invocation and the retrying wrapper

mod interceptor;
mod listener;
mod metrics;
mod retry_executor;
mod step_executor;

pub use interceptor::StepInterceptor;
pub use listener::RetryListener;
pub use metrics::{RetryMetrics, StepRetryStats};
pub use retry_executor::RetryExecutor;
pub use step_executor::StepExecutor;
