//! Step failure values and the instance-level error record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Taxonomy of engine error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed inputs to engine operations
    InvalidArgument,

    /// Operation not legal in the instance's current state
    StateViolation,

    /// No legal next step for a result
    RoutingFailure,

    /// Input type not acceptable where it was offered
    TypeMismatch,

    /// Per-step invocation limit exceeded
    InvocationLimit,

    /// Transient failure that matched the retry predicates
    Retryable,

    /// Failure that matched `abort_on` or fell outside `retry_on`
    NonRetryable,

    /// Rejected by an open circuit breaker before execution
    CircuitBreakerOpen,

    /// Explicit cancellation or worker interruption
    Cancellation,

    /// Repository save/load failure
    Infrastructure,

    /// Engine-internal inconsistency
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InvalidArgument => "invalid_argument",
            Self::StateViolation => "state_violation",
            Self::RoutingFailure => "routing_failure",
            Self::TypeMismatch => "type_mismatch",
            Self::InvocationLimit => "invocation_limit",
            Self::Retryable => "retryable",
            Self::NonRetryable => "non_retryable",
            Self::CircuitBreakerOpen => "circuit_breaker_open",
            Self::Cancellation => "cancellation",
            Self::Infrastructure => "infrastructure",
            Self::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

/// One element of a failure's cause chain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureCause {
    /// Error type tag (matched against retry/abort predicates)
    pub error_type: Option<String>,

    /// Human-readable message
    pub message: String,
}

/// Error value produced by a failing step
///
/// The `error_type` tag and the tags along the cause chain are what the
/// retry predicates (`retry_on`/`abort_on`) match against.
///
/// # Example
///
/// ```
/// use runloom::state::StepFailure;
///
/// let failure = StepFailure::new("upstream unavailable")
///     .with_type("TransientError")
///     .caused_by("IoError", "connection reset");
///
/// assert!(failure.kinds().any(|k| k == "TransientError"));
/// assert!(failure.kinds().any(|k| k == "IoError"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepFailure {
    /// Error message
    pub message: String,

    /// Error type tag for programmatic handling
    pub error_type: Option<String>,

    /// Ordered cause chain (outermost first)
    #[serde(default)]
    pub causes: Vec<FailureCause>,

    /// Taxonomy kind, stamped by the engine once classified
    #[serde(default)]
    pub kind: Option<ErrorKind>,

    /// Additional details (for debugging)
    pub details: Option<serde_json::Value>,
}

impl StepFailure {
    /// Create a new failure
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            causes: vec![],
            kind: None,
            details: None,
        }
    }

    /// Create a cancellation failure
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(message).with_kind(ErrorKind::Cancellation)
    }

    /// Set the error type tag
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Stamp the taxonomy kind
    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Append a cause to the chain
    pub fn caused_by(
        mut self,
        error_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        self.causes.push(FailureCause {
            error_type: Some(error_type.into()),
            message: message.into(),
        });
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// All error type tags along the chain, outermost first
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.error_type
            .as_deref()
            .into_iter()
            .chain(self.causes.iter().filter_map(|c| c.error_type.as_deref()))
    }

    /// Cause chain rendered as short strings (for error records)
    pub fn cause_summary(&self) -> Vec<String> {
        self.causes
            .iter()
            .map(|c| match &c.error_type {
                Some(t) => format!("{t}: {}", c.message),
                None => c.message.clone(),
            })
            .collect()
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error_type {
            Some(t) => write!(f, "{t}: {}", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for StepFailure {}

impl From<anyhow::Error> for StepFailure {
    fn from(err: anyhow::Error) -> Self {
        let mut chain = err.chain();
        let message = chain
            .next()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        let causes = chain
            .map(|e| FailureCause {
                error_type: None,
                message: e.to_string(),
            })
            .collect();
        Self {
            message,
            error_type: None,
            causes,
            kind: None,
            details: None,
        }
    }
}

impl From<crate::state::StateError> for StepFailure {
    fn from(err: crate::state::StateError) -> Self {
        let kind = match &err {
            crate::state::StateError::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            _ => ErrorKind::NonRetryable,
        };
        Self::new(err.to_string())
            .with_type("SerializationError")
            .with_kind(kind)
    }
}

/// Error record attached to a failed instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorInfo {
    /// Taxonomy kind
    pub kind: ErrorKind,

    /// Error message
    pub message: String,

    /// Step the error is attributed to, if any
    pub step_id: Option<String>,

    /// When the error occurred
    pub occurred_at: DateTime<Utc>,

    /// Cause chain summary
    #[serde(default)]
    pub cause_summary: Vec<String>,
}

impl ErrorInfo {
    /// Create a new error record
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            step_id: None,
            occurred_at: Utc::now(),
            cause_summary: vec![],
        }
    }

    /// Attribute the error to a step
    pub fn at_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    /// Build from a step failure, defaulting unclassified failures to `default_kind`
    pub fn from_failure(failure: &StepFailure, default_kind: ErrorKind) -> Self {
        Self {
            kind: failure.kind.unwrap_or(default_kind),
            message: failure.to_string(),
            step_id: None,
            occurred_at: Utc::now(),
            cause_summary: failure.cause_summary(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.step_id {
            Some(step) => write!(f, "[{}] {} (step {step})", self.kind, self.message),
            None => write!(f, "[{}] {}", self.kind, self.message),
        }
    }
}
