//! Per-step circuit breaker
//!
//! Protects repeatedly-failing steps from being hammered. Each step id gets
//! its own closed/open/half-open state machine; transitions are atomic per
//! step because every operation goes through the map entry's exclusive
//! guard.
//!
//! ```text
//! ┌─────────┐  failure threshold  ┌─────────┐  open duration  ┌──────────┐
//! │ Closed  │ ─────────────────► │  Open   │ ──────────────► │ HalfOpen │
//! └─────────┘                     └─────────┘                 └──────────┘
//!      ▲                               ▲      failure / window expiry │
//!      │        success threshold      └──────────────────────────────┘
//!      └───────────────────────────────────────────────────────┘
//! ```

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    Closed,

    /// Failure threshold exceeded - all calls rejected
    Open,

    /// Testing if the step recovered - limited probes allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to open the circuit
    pub failure_threshold: u32,

    /// Successes required in half-open to close the circuit
    pub success_threshold: u32,

    /// Time to wait before transitioning from open to half-open
    #[serde(with = "duration_millis")]
    pub open_duration: Duration,

    /// How long the half-open probe window stays open
    #[serde(with = "duration_millis")]
    pub half_open_duration: Duration,

    /// Maximum concurrent probes admitted while half-open
    pub half_open_max_attempts: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_secs(30),
            half_open_duration: Duration::from_secs(15),
            half_open_max_attempts: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the success threshold
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    /// Set the open duration
    pub fn with_open_duration(mut self, duration: Duration) -> Self {
        self.open_duration = duration;
        self
    }

    /// Set the half-open window duration
    pub fn with_half_open_duration(mut self, duration: Duration) -> Self {
        self.half_open_duration = duration;
        self
    }

    /// Set the maximum half-open probes
    pub fn with_half_open_max_attempts(mut self, attempts: u32) -> Self {
        self.half_open_max_attempts = attempts.max(1);
        self
    }
}

/// Per-step breaker bookkeeping
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    half_open_probes: u32,
    opened_at: Option<Instant>,
    half_open_at: Option<Instant>,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            half_open_probes: 0,
            opened_at: None,
            half_open_at: None,
        }
    }
}

impl BreakerState {
    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.half_open_at = None;
        self.half_open_successes = 0;
        self.half_open_probes = 0;
    }

    fn close(&mut self) {
        *self = Self::default();
    }
}

/// Per-step admission control with closed/open/half-open states
///
/// # Example
///
/// ```
/// use runloom::reliability::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
///
/// let breaker = CircuitBreaker::new(CircuitBreakerConfig::new().with_failure_threshold(2));
/// breaker.record_failure("step");
/// breaker.record_failure("step");
/// assert_eq!(breaker.state("step"), CircuitState::Open);
/// assert!(!breaker.allow_execution("step"));
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, BreakerState>,
}

impl CircuitBreaker {
    /// Create a breaker registry with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// The configuration in effect
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether a call for this step is admitted right now
    ///
    /// Open circuits transition to half-open once the open duration has
    /// elapsed, and the transitioning call is admitted as the first probe.
    /// Half-open windows expire back to open; the probe counter is checked
    /// only while the window is live.
    pub fn allow_execution(&self, step_id: &str) -> bool {
        let mut entry = self.breakers.entry(step_id.to_string()).or_default();

        match entry.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = entry
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.open_duration {
                    debug!(step_id, "circuit breaker half-open, admitting probe");
                    entry.state = CircuitState::HalfOpen;
                    entry.half_open_at = Some(Instant::now());
                    entry.half_open_successes = 0;
                    entry.half_open_probes = 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                let elapsed = entry
                    .half_open_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.half_open_duration {
                    warn!(step_id, "half-open window expired without recovery");
                    entry.open();
                    return false;
                }
                if entry.half_open_probes < self.config.half_open_max_attempts {
                    entry.half_open_probes += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful execution for a step
    pub fn record_success(&self, step_id: &str) {
        let mut entry = self.breakers.entry(step_id.to_string()).or_default();

        match entry.state {
            CircuitState::Closed => {
                entry.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                entry.half_open_successes += 1;
                if entry.half_open_successes >= self.config.success_threshold {
                    debug!(step_id, "circuit breaker closed after recovery");
                    entry.close();
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed execution for a step
    pub fn record_failure(&self, step_id: &str) {
        let mut entry = self.breakers.entry(step_id.to_string()).or_default();

        match entry.state {
            CircuitState::Closed => {
                entry.consecutive_failures += 1;
                if entry.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        step_id,
                        failures = entry.consecutive_failures,
                        "circuit breaker opened"
                    );
                    entry.open();
                }
            }
            CircuitState::HalfOpen => {
                warn!(step_id, "probe failed, circuit breaker re-opened");
                entry.open();
            }
            CircuitState::Open => {}
        }
    }

    /// Current state for a step (Closed when never seen)
    pub fn state(&self, step_id: &str) -> CircuitState {
        self.breakers
            .get(step_id)
            .map(|e| e.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Reset one step to Closed with counters cleared
    pub fn reset(&self, step_id: &str) {
        if let Some(mut entry) = self.breakers.get_mut(step_id) {
            entry.close();
        }
    }

    /// Reset every step
    pub fn reset_all(&self) {
        self.breakers.clear();
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
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

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig::new()
            .with_failure_threshold(3)
            .with_success_threshold(2)
            .with_open_duration(Duration::from_millis(50))
            .with_half_open_duration(Duration::from_millis(200))
            .with_half_open_max_attempts(1)
    }

    #[test]
    fn test_closed_allows_execution() {
        let breaker = CircuitBreaker::default();
        assert!(breaker.allow_execution("step"));
        assert_eq!(breaker.state("step"), CircuitState::Closed);
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new(fast_config());

        breaker.record_failure("step");
        breaker.record_failure("step");
        assert_eq!(breaker.state("step"), CircuitState::Closed);

        breaker.record_failure("step");
        assert_eq!(breaker.state("step"), CircuitState::Open);
        assert!(!breaker.allow_execution("step"));
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let breaker = CircuitBreaker::new(fast_config());

        breaker.record_failure("step");
        breaker.record_failure("step");
        breaker.record_success("step");
        breaker.record_failure("step");
        breaker.record_failure("step");

        assert_eq!(breaker.state("step"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_probe_after_open_duration() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure("step");
        }
        assert!(!breaker.allow_execution("step"));

        tokio::time::sleep(Duration::from_millis(60)).await;

        // exactly one probe is admitted (half_open_max_attempts = 1)
        assert!(breaker.allow_execution("step"));
        assert_eq!(breaker.state("step"), CircuitState::HalfOpen);
        assert!(!breaker.allow_execution("step"));
    }

    #[tokio::test]
    async fn test_probe_failure_reopens() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure("step");
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(breaker.allow_execution("step"));
        breaker.record_failure("step");

        assert_eq!(breaker.state("step"), CircuitState::Open);
        assert!(!breaker.allow_execution("step"));
    }

    #[tokio::test]
    async fn test_closes_after_success_threshold() {
        let config = fast_config().with_half_open_max_attempts(3);
        let breaker = CircuitBreaker::new(config);
        for _ in 0..3 {
            breaker.record_failure("step");
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(breaker.allow_execution("step"));
        breaker.record_success("step");
        assert_eq!(breaker.state("step"), CircuitState::HalfOpen);

        assert!(breaker.allow_execution("step"));
        breaker.record_success("step");
        assert_eq!(breaker.state("step"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_window_expiry_reopens() {
        let config = fast_config()
            .with_half_open_duration(Duration::from_millis(30))
            .with_half_open_max_attempts(5);
        let breaker = CircuitBreaker::new(config);
        for _ in 0..3 {
            breaker.record_failure("step");
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(breaker.allow_execution("step"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!breaker.allow_execution("step"));
        assert_eq!(breaker.state("step"), CircuitState::Open);
    }

    #[test]
    fn test_reset() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure("step");
        }
        assert_eq!(breaker.state("step"), CircuitState::Open);

        breaker.reset("step");
        assert_eq!(breaker.state("step"), CircuitState::Closed);
        assert!(breaker.allow_execution("step"));
    }

    #[test]
    fn test_steps_are_independent() {
        let breaker = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            breaker.record_failure("a");
        }
        assert!(!breaker.allow_execution("a"));
        assert!(breaker.allow_execution("b"));
    }
}
