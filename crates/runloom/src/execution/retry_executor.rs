//! Retrying step execution
//!
//! Wraps the step executor with attempt accounting, backoff with jitter,
//! conditional retry/abort predicates, circuit-breaker gating, and
//! invocation-limit enforcement. Retry delays are cancellable: the sleep
//! races the instance's cancellation token on the runtime's timer wheel, so
//! no worker spins while waiting.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::graph::{OnInvocationLimit, StepNode};
use crate::reliability::{CircuitBreaker, RetryContext, RetryDecision, RetryPolicy};
use crate::state::{ErrorKind, StepFailure, StepResult, WorkflowInstance};

use super::listener::RetryListener;
use super::metrics::RetryMetrics;
use super::step_executor::StepExecutor;

fn stamp(failure: StepFailure, kind: ErrorKind) -> StepFailure {
    if failure.kind.is_none() {
        failure.with_kind(kind)
    } else {
        failure
    }
}

/// Step executor with retry, circuit breaking, and invocation limits
pub struct RetryExecutor {
    step_executor: StepExecutor,
    breaker: Arc<CircuitBreaker>,
    metrics: Arc<RetryMetrics>,
    listeners: Vec<Arc<dyn RetryListener>>,
}

impl RetryExecutor {
    /// Create a retry executor
    pub fn new(step_executor: StepExecutor, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            step_executor,
            breaker,
            metrics: Arc::new(RetryMetrics::new()),
            listeners: Vec::new(),
        }
    }

    /// Share an external metrics registry
    pub fn with_metrics(mut self, metrics: Arc<RetryMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Attach retry listeners
    pub fn with_listeners(mut self, listeners: Vec<Arc<dyn RetryListener>>) -> Self {
        self.listeners = listeners;
        self
    }

    /// The metrics registry
    pub fn metrics(&self) -> &RetryMetrics {
        &self.metrics
    }

    /// The circuit breaker registry
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Execute a step under its retry policy
    ///
    /// Order of gates: circuit breaker, then invocation limit, then the
    /// retry loop (or a single attempt when no policy applies).
    pub async fn execute(
        &self,
        instance: &mut WorkflowInstance,
        step: &StepNode,
        cancel: &CancellationToken,
    ) -> Result<StepResult, StepFailure> {
        let step_id = step.id();

        if !self.breaker.allow_execution(step_id) {
            return Err(StepFailure::new(format!(
                "circuit breaker open for step '{step_id}'"
            ))
            .with_type("CircuitBreakerOpen")
            .with_kind(ErrorKind::CircuitBreakerOpen));
        }

        let invocations = instance.context.increment_execution_count(step_id);
        if invocations > step.config().invocation_limit {
            match step.config().on_invocation_limit {
                OnInvocationLimit::Error => {
                    return Err(StepFailure::new(format!(
                        "step '{step_id}' exceeded its invocation limit of {}",
                        step.config().invocation_limit
                    ))
                    .with_type("InvocationLimitExceeded")
                    .with_kind(ErrorKind::InvocationLimit));
                }
                OnInvocationLimit::Stop => {
                    warn!(step_id, invocations, "invocation limit reached, stopping workflow");
                    return Ok(StepResult::finish_empty());
                }
                OnInvocationLimit::Continue => {
                    warn!(step_id, invocations, "invocation limit exceeded, continuing");
                }
            }
        }

        let policy = step
            .config()
            .retry_policy
            .clone()
            .filter(|p| p.max_attempts > 1);
        match policy {
            Some(policy) => self.run_with_retries(instance, step, &policy, cancel).await,
            None => self.run_once(instance, step).await,
        }
    }

    async fn run_once(
        &self,
        instance: &mut WorkflowInstance,
        step: &StepNode,
    ) -> Result<StepResult, StepFailure> {
        match self.step_executor.execute_step(instance, step, 1).await {
            Ok(result) => {
                self.breaker.record_success(step.id());
                Ok(result)
            }
            Err(failure) => {
                self.breaker.record_failure(step.id());
                self.metrics
                    .record_failure_kind(step.id(), failure.error_type.as_deref());
                Err(failure)
            }
        }
    }

    async fn run_with_retries(
        &self,
        instance: &mut WorkflowInstance,
        step: &StepNode,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<StepResult, StepFailure> {
        let step_id = step.id().to_string();
        let mut retry_ctx = RetryContext::new(&step_id, policy.max_attempts);

        loop {
            let attempt = retry_ctx.begin_attempt();
            instance
                .context
                .set_retry_context(&step_id, retry_ctx.clone());

            let started = Instant::now();
            let outcome = self.step_executor.execute_step(instance, step, attempt).await;

            let failure = match outcome {
                Ok(StepResult::Fail { error }) if policy.retry_on_fail_result => {
                    debug!(step_id = %step_id, attempt, "fail result treated as thrown failure");
                    error
                }
                Ok(result) => {
                    self.breaker.record_success(&step_id);
                    if attempt > 1 {
                        self.metrics.record_success_after_retry(&step_id);
                        for listener in &self.listeners {
                            if let Err(e) = listener.on_retry_success(&step_id, attempt).await {
                                warn!(step_id = %step_id, error = %e, "retry listener failed");
                            }
                        }
                    }
                    return Ok(result);
                }
                Err(failure) => failure,
            };

            retry_ctx.record_failure(started.elapsed(), &failure);
            instance
                .context
                .set_retry_context(&step_id, retry_ctx.clone());
            self.breaker.record_failure(&step_id);
            self.metrics
                .record_failure_kind(&step_id, failure.error_type.as_deref());

            match policy.decide(&failure) {
                RetryDecision::Abort => {
                    for listener in &self.listeners {
                        if let Err(e) = listener.on_retry_aborted(&step_id, attempt, &failure).await
                        {
                            warn!(step_id = %step_id, error = %e, "retry listener failed");
                        }
                    }
                    return Err(stamp(failure, ErrorKind::NonRetryable));
                }
                RetryDecision::NoMatch => {
                    for listener in &self.listeners {
                        if let Err(e) = listener
                            .on_retry_failure(&step_id, attempt, false, &failure)
                            .await
                        {
                            warn!(step_id = %step_id, error = %e, "retry listener failed");
                        }
                    }
                    return Err(stamp(failure, ErrorKind::NonRetryable));
                }
                RetryDecision::Retry => {
                    if !policy.has_attempts_remaining(attempt) {
                        self.metrics.record_exhausted(&step_id);
                        for listener in &self.listeners {
                            if let Err(e) =
                                listener.on_retry_exhausted(&step_id, attempt, &failure).await
                            {
                                warn!(step_id = %step_id, error = %e, "retry listener failed");
                            }
                        }
                        return Err(stamp(failure, ErrorKind::Retryable));
                    }

                    self.metrics.record_retry_attempt(&step_id);
                    for listener in &self.listeners {
                        if let Err(e) = listener
                            .on_retry_failure(&step_id, attempt, true, &failure)
                            .await
                        {
                            warn!(step_id = %step_id, error = %e, "retry listener failed");
                        }
                    }

                    let delay = policy.delay_for_attempt(attempt);
                    for listener in &self.listeners {
                        if let Err(e) = listener.before_retry(&step_id, attempt + 1, delay).await {
                            warn!(step_id = %step_id, error = %e, "retry listener failed");
                        }
                    }
                    debug!(step_id = %step_id, attempt, delay_ms = delay.as_millis() as u64, "backing off before retry");

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            return Err(StepFailure::cancelled(
                                "retry wait interrupted by cancellation",
                            )
                            .with_type("Cancelled"));
                        }
                    }
                }
            }
        }
    }
}
