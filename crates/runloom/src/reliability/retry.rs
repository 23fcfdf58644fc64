//! Retry policy and per-step retry context

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::state::StepFailure;

/// What the retry strategy decided for a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// The failure matched the retry predicates; retry
    Retry,

    /// The failure matched `abort_on`; stop immediately
    Abort,

    /// `retry_on` is non-empty and nothing matched; do not retry
    NoMatch,
}

/// Configuration for step retries
///
/// Supports exponential backoff with jitter to avoid thundering herd, plus
/// kind-tag predicates deciding which failures are worth retrying. Abort
/// predicates take precedence over retry predicates at every level of the
/// cause chain.
///
/// # Example
///
/// ```
/// use runloom::reliability::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(4)
///     .with_initial_delay(Duration::from_millis(10))
///     .with_retry_on("TransientError")
///     .with_abort_on("FatalError");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial one), ≥ 1
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,

    /// Maximum delay between retries
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Backoff multiplier (e.g. 2.0 for exponential), ≥ 1.0
    pub backoff_multiplier: f64,

    /// Jitter factor in [0, 1]; the computed delay is multiplied by
    /// `1 + jitter_factor · U[0, 1)`
    pub jitter_factor: f64,

    /// Error kinds worth retrying; empty means retry everything not aborted
    #[serde(default)]
    pub retry_on: Vec<String>,

    /// Error kinds that abort retrying (take precedence over `retry_on`)
    #[serde(default)]
    pub abort_on: Vec<String>,

    /// Treat a returned `Fail` result as a thrown failure
    #[serde(default)]
    pub retry_on_fail_result: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Exponential backoff with sensible defaults
    ///
    /// - 3 max attempts
    /// - 500 ms initial delay
    /// - 30 second max delay
    /// - 2x backoff multiplier
    /// - 10% jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            retry_on: vec![],
            abort_on: vec![],
            retry_on_fail_result: false,
        }
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
            retry_on: vec![],
            abort_on: vec![],
            retry_on_fail_result: false,
        }
    }

    /// Fixed-interval retries (no backoff)
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: interval,
            max_delay: interval,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
            retry_on: vec![],
            abort_on: vec![],
            retry_on_fail_result: false,
        }
    }

    /// Set the maximum number of attempts (clamped to ≥ 1)
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the initial retry delay
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the maximum retry delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the backoff multiplier (clamped to ≥ 1.0)
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Set the jitter factor (clamped to [0, 1])
    pub fn with_jitter_factor(mut self, jitter: f64) -> Self {
        self.jitter_factor = jitter.clamp(0.0, 1.0);
        self
    }

    /// Add a retryable error kind
    pub fn with_retry_on(mut self, kind: impl Into<String>) -> Self {
        self.retry_on.push(kind.into());
        self
    }

    /// Add an aborting error kind
    pub fn with_abort_on(mut self, kind: impl Into<String>) -> Self {
        self.abort_on.push(kind.into());
        self
    }

    /// Treat returned `Fail` results as thrown failures
    pub fn with_retry_on_fail_result(mut self, enabled: bool) -> Self {
        self.retry_on_fail_result = enabled;
        self
    }

    /// Delay to sleep after `completed_attempts` failed attempts (1-based)
    ///
    /// `min(max_delay, initial_delay · multiplier^(completed_attempts − 1))`,
    /// then jitter is applied multiplicatively.
    pub fn delay_for_attempt(&self, completed_attempts: u32) -> Duration {
        if completed_attempts == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(completed_attempts as i32 - 1);
        let capped = base.min(self.max_delay.as_secs_f64());

        let jittered = if self.jitter_factor > 0.0 {
            let mut rng = rand::thread_rng();
            capped * (1.0 + self.jitter_factor * rng.gen_range(0.0..1.0))
        } else {
            capped
        };

        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Decide whether a failure should be retried
    ///
    /// Traverses the failure's kind tags (outermost first, cause chain
    /// included). Any `abort_on` match wins; otherwise an empty `retry_on`
    /// retries everything, and a non-empty one requires a match.
    pub fn decide(&self, failure: &StepFailure) -> RetryDecision {
        if failure
            .kinds()
            .any(|k| self.abort_on.iter().any(|a| a == k))
        {
            return RetryDecision::Abort;
        }
        if self.retry_on.is_empty() {
            return RetryDecision::Retry;
        }
        if failure
            .kinds()
            .any(|k| self.retry_on.iter().any(|r| r == k))
        {
            RetryDecision::Retry
        } else {
            RetryDecision::NoMatch
        }
    }

    /// Whether attempts remain after `current_attempt` (1-based)
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }
}

/// One prior attempt recorded in a retry context
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptRecord {
    /// When the attempt finished
    pub timestamp: DateTime<Utc>,

    /// How long the attempt ran
    pub duration_ms: u64,

    /// The failure that ended it
    pub failure: String,
}

/// Per-step retry bookkeeping, persisted with the instance context
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryContext {
    /// Step being retried
    pub step_id: String,

    /// Current attempt number (1-based)
    pub attempt_number: u32,

    /// Attempt ceiling from the policy
    pub max_attempts: u32,

    /// Prior failed attempts, oldest first
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,

    /// When the first attempt started
    pub first_attempt_at: DateTime<Utc>,

    /// When the current attempt started
    pub current_attempt_at: DateTime<Utc>,
}

impl RetryContext {
    /// Start tracking retries for a step
    pub fn new(step_id: impl Into<String>, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            step_id: step_id.into(),
            attempt_number: 0,
            max_attempts,
            attempts: Vec::new(),
            first_attempt_at: now,
            current_attempt_at: now,
        }
    }

    /// Begin the next attempt
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempt_number += 1;
        self.current_attempt_at = Utc::now();
        self.attempt_number
    }

    /// Record a failed attempt
    pub fn record_failure(&mut self, duration: Duration, failure: &StepFailure) {
        self.attempts.push(AttemptRecord {
            timestamp: Utc::now(),
            duration_ms: duration.as_millis() as u64,
            failure: failure.to_string(),
        });
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_defaults() {
        let policy = RetryPolicy::exponential();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff_multiplier, 2.0);
        assert!(!policy.retry_on_fail_result);
    }

    #[test]
    fn test_delay_progression_without_jitter() {
        let policy = RetryPolicy::exponential()
            .with_initial_delay(Duration::from_millis(10))
            .with_jitter_factor(0.0);

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(40));
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = RetryPolicy::exponential()
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_jitter_factor(0.0);

        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::exponential()
            .with_initial_delay(Duration::from_millis(100))
            .with_jitter_factor(0.5);

        for _ in 0..50 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay < Duration::from_millis(150));
        }
    }

    #[test]
    fn test_empty_retry_on_retries_everything() {
        let policy = RetryPolicy::exponential();
        let failure = StepFailure::new("boom").with_type("Whatever");
        assert_eq!(policy.decide(&failure), RetryDecision::Retry);
    }

    #[test]
    fn test_retry_on_requires_match() {
        let policy = RetryPolicy::exponential().with_retry_on("TransientError");

        let transient = StepFailure::new("blip").with_type("TransientError");
        assert_eq!(policy.decide(&transient), RetryDecision::Retry);

        let other = StepFailure::new("nope").with_type("ValidationError");
        assert_eq!(policy.decide(&other), RetryDecision::NoMatch);
    }

    #[test]
    fn test_abort_wins_over_retry_in_cause_chain() {
        let policy = RetryPolicy::exponential()
            .with_retry_on("TransientError")
            .with_abort_on("FatalError");

        // outer kind is retryable but a cause is fatal
        let failure = StepFailure::new("wrapped")
            .with_type("TransientError")
            .caused_by("FatalError", "disk on fire");

        assert_eq!(policy.decide(&failure), RetryDecision::Abort);
    }

    #[test]
    fn test_retry_context_attempt_accounting() {
        let mut ctx = RetryContext::new("flaky", 4);
        assert_eq!(ctx.begin_attempt(), 1);
        ctx.record_failure(Duration::from_millis(5), &StepFailure::new("e1"));
        assert_eq!(ctx.begin_attempt(), 2);

        assert_eq!(ctx.attempts.len(), 1);
        assert_eq!(ctx.attempt_number, 2);
    }

    #[test]
    fn test_serialization() {
        let policy = RetryPolicy::exponential()
            .with_retry_on("A")
            .with_abort_on("B")
            .with_retry_on_fail_result(true);

        let json = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(policy, parsed);
    }
}
