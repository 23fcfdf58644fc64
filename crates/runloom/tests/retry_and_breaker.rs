//! Retry and circuit-breaker scenarios

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use runloom::prelude::*;

fn flaky_graph(fail_times: u32, counter: Arc<AtomicU32>, policy: RetryPolicy) -> runloom::Graph {
    GraphBuilder::new("flaky-wf", "1.0")
        .start_with(
            StepDefinition::of("flaky", move |n: i64, _ctx| {
                let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if attempt <= fail_times {
                        Err(StepFailure::new("connection reset").with_type("TransientError"))
                    } else {
                        StepResult::finish(n).map_err(Into::into)
                    }
                }
            })
            .with_retry(policy),
        )
        .build()
        .unwrap()
}

#[test_log::test(tokio::test)]
async fn exponential_backoff_recovers_on_third_attempt() {
    let counter = Arc::new(AtomicU32::new(0));
    let policy = RetryPolicy::exponential()
        .with_max_attempts(4)
        .with_initial_delay(Duration::from_millis(10))
        .with_backoff_multiplier(2.0)
        .with_jitter_factor(0.0);

    let engine = WorkflowEngine::new();
    engine.register(flaky_graph(2, counter.clone(), policy)).unwrap();

    let started = Instant::now();
    let execution = engine.execute::<i64, i64>("flaky-wf", 7).await.unwrap();
    assert_eq!(execution.result().await.unwrap(), 7);
    let elapsed = started.elapsed();

    // two failures then success: delays of ~10ms and ~20ms
    assert_eq!(counter.load(Ordering::SeqCst), 3);
    assert!(elapsed >= Duration::from_millis(30), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "elapsed {elapsed:?}");

    let stats = engine.retry_metrics().snapshot("flaky").unwrap();
    assert_eq!(stats.retry_attempts, 2);
    assert_eq!(stats.successes_after_retry, 1);
    assert_eq!(stats.exhausted_retries, 0);
    assert_eq!(stats.last_failure_kind.as_deref(), Some("TransientError"));
}

#[tokio::test]
async fn abort_on_matches_and_skips_retries() {
    let counter = Arc::new(AtomicU32::new(0));
    let policy = RetryPolicy::exponential()
        .with_max_attempts(4)
        .with_initial_delay(Duration::from_millis(10))
        .with_jitter_factor(0.0)
        .with_abort_on("FatalError");

    let counter_in_step = counter.clone();
    let graph = GraphBuilder::new("fatal-wf", "1.0")
        .start_with(
            StepDefinition::of("flaky", move |_: i64, _ctx| {
                counter_in_step.fetch_add(1, Ordering::SeqCst);
                async move {
                    Err::<StepResult, _>(StepFailure::new("disk on fire").with_type("FatalError"))
                }
            })
            .with_retry(policy),
        )
        .build()
        .unwrap();

    let engine = WorkflowEngine::new();
    engine.register(graph).unwrap();

    let execution = engine.execute::<i64, i64>("fatal-wf", 1).await.unwrap();
    match execution.result().await {
        Err(EngineError::WorkflowFailed(info)) => {
            assert_eq!(info.kind, ErrorKind::NonRetryable);
        }
        other => panic!("expected workflow failure, got {other:?}"),
    }
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn exhausted_retries_fail_with_retryable_kind() {
    let counter = Arc::new(AtomicU32::new(0));
    let policy = RetryPolicy::exponential()
        .with_max_attempts(3)
        .with_initial_delay(Duration::from_millis(2))
        .with_jitter_factor(0.0)
        .with_retry_on("TransientError");

    let engine = WorkflowEngine::new();
    engine
        .register(flaky_graph(10, counter.clone(), policy))
        .unwrap();

    let execution = engine.execute::<i64, i64>("flaky-wf", 1).await.unwrap();
    match execution.result().await {
        Err(EngineError::WorkflowFailed(info)) => {
            assert_eq!(info.kind, ErrorKind::Retryable);
            assert_eq!(info.step_id.as_deref(), Some("flaky"));
        }
        other => panic!("expected workflow failure, got {other:?}"),
    }
    assert_eq!(counter.load(Ordering::SeqCst), 3);
    assert_eq!(
        engine.retry_metrics().snapshot("flaky").unwrap().exhausted_retries,
        1
    );
}

#[test_log::test(tokio::test)]
async fn circuit_breaker_rejects_then_probes_after_open_duration() {
    let counter = Arc::new(AtomicU32::new(0));
    let counter_in_step = counter.clone();
    let graph = GraphBuilder::new("down-wf", "1.0")
        .start_with(StepDefinition::of("always-down", move |_: i64, _ctx| {
            counter_in_step.fetch_add(1, Ordering::SeqCst);
            async move {
                Err::<StepResult, _>(StepFailure::new("service down").with_type("DownError"))
            }
        }))
        .build()
        .unwrap();

    let engine = WorkflowEngine::builder()
        .with_config(EngineConfig::new().with_circuit_breaker(
            CircuitBreakerConfig::new()
                .with_failure_threshold(3)
                .with_open_duration(Duration::from_millis(50))
                .with_half_open_max_attempts(1),
        ))
        .build();
    engine.register(graph).unwrap();

    // three failing executions trip the breaker
    for _ in 0..3 {
        let execution = engine.execute::<i64, i64>("down-wf", 1).await.unwrap();
        assert!(execution.result().await.is_err());
    }
    assert_eq!(counter.load(Ordering::SeqCst), 3);
    assert_eq!(engine.circuit_breaker().state("always-down"), CircuitState::Open);

    // the fourth is rejected before the handler runs
    let execution = engine.execute::<i64, i64>("down-wf", 1).await.unwrap();
    match execution.result().await {
        Err(EngineError::WorkflowFailed(info)) => {
            assert_eq!(info.kind, ErrorKind::CircuitBreakerOpen);
        }
        other => panic!("expected circuit-breaker rejection, got {other:?}"),
    }
    assert_eq!(counter.load(Ordering::SeqCst), 3);

    // after the open duration exactly one probe is admitted; its failure
    // re-opens the circuit
    tokio::time::sleep(Duration::from_millis(60)).await;
    let execution = engine.execute::<i64, i64>("down-wf", 1).await.unwrap();
    assert!(execution.result().await.is_err());
    assert_eq!(counter.load(Ordering::SeqCst), 4);
    assert_eq!(engine.circuit_breaker().state("always-down"), CircuitState::Open);

    let execution = engine.execute::<i64, i64>("down-wf", 1).await.unwrap();
    match execution.result().await {
        Err(EngineError::WorkflowFailed(info)) => {
            assert_eq!(info.kind, ErrorKind::CircuitBreakerOpen);
        }
        other => panic!("expected circuit-breaker rejection, got {other:?}"),
    }
    assert_eq!(counter.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn retry_listener_observes_lifecycle() {
    use async_trait::async_trait;

    #[derive(Default)]
    struct Events {
        before: AtomicU32,
        failures: AtomicU32,
        successes: AtomicU32,
    }

    struct Recorder(Arc<Events>);

    #[async_trait]
    impl RetryListener for Recorder {
        async fn before_retry(
            &self,
            _step_id: &str,
            _next_attempt: u32,
            _delay: Duration,
        ) -> anyhow::Result<()> {
            self.0.before.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn on_retry_failure(
            &self,
            _step_id: &str,
            _attempt: u32,
            _will_retry: bool,
            _error: &StepFailure,
        ) -> anyhow::Result<()> {
            self.0.failures.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn on_retry_success(&self, _step_id: &str, _attempt: u32) -> anyhow::Result<()> {
            self.0.successes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let events = Arc::new(Events::default());
    let counter = Arc::new(AtomicU32::new(0));
    let policy = RetryPolicy::exponential()
        .with_max_attempts(4)
        .with_initial_delay(Duration::from_millis(2))
        .with_jitter_factor(0.0);

    let engine = WorkflowEngine::builder()
        .add_retry_listener(Arc::new(Recorder(events.clone())))
        .build();
    engine.register(flaky_graph(2, counter, policy)).unwrap();

    let execution = engine.execute::<i64, i64>("flaky-wf", 3).await.unwrap();
    assert_eq!(execution.result().await.unwrap(), 3);

    assert_eq!(events.before.load(Ordering::SeqCst), 2);
    assert_eq!(events.failures.load(Ordering::SeqCst), 2);
    assert_eq!(events.successes.load(Ordering::SeqCst), 1);
}
