//! Type tokens and the durable step-output wrapper
//!
//! Steps exchange values as [`StepOutput`]: the JSON-serialized form plus a
//! [`TypeToken`] capturing the value's type identity. Routing decisions
//! compare tokens; typed access re-checks the token and deserializes lazily.

use std::sync::OnceLock;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Error type for state and serialization operations
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum StateError {
    /// Value could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Captured type does not satisfy the requested type
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    /// No value present
    #[error("no value present")]
    Empty,
}

/// Type identity captured at graph-build time
///
/// Rust has no runtime reflection, so type-based routing works on tokens:
/// the logical type name recorded when a typed closure or value is erased.
/// [`TypeToken::value`] denotes the dynamic JSON type and acts as the
/// assignability wildcard, a step declaring it accepts any payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeToken {
    name: String,
}

impl TypeToken {
    /// Capture the token for a concrete type
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            name: std::any::type_name::<T>().to_string(),
        }
    }

    /// Create a token from an explicit type name
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The wildcard token: `serde_json::Value` accepts any payload
    pub fn value() -> Self {
        Self::of::<serde_json::Value>()
    }

    /// Full type name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last path segment of the type name (for schemas and logs)
    pub fn short_name(&self) -> &str {
        self.name.rsplit("::").next().unwrap_or(&self.name)
    }

    /// Whether this is the dynamic-value wildcard
    pub fn is_value(&self) -> bool {
        self.name == std::any::type_name::<serde_json::Value>()
    }

    /// Whether a payload of type `source` is acceptable where `self` is
    /// declared (the assignability check)
    pub fn accepts(&self, source: &TypeToken) -> bool {
        self.is_value() || self == source
    }
}

impl std::fmt::Display for TypeToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Durable wrapper for a step's produced value
///
/// Carries the serialized form (for persistence) and the type identity of
/// the produced value. Decoding is lazy and cached.
///
/// Invariant: `has_value() ⇔ serialized and token are both present`.
///
/// # Example
///
/// ```
/// use runloom::state::{StepOutput, TypeToken};
///
/// let out = StepOutput::of(&42i64).unwrap();
/// assert!(out.has_value());
/// assert_eq!(out.value::<i64>().unwrap(), 42);
/// assert!(out.is_compatible_with(&TypeToken::of::<i64>()));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutput {
    serialized: Option<String>,
    type_token: Option<TypeToken>,

    #[serde(skip, default)]
    decoded: OnceLock<serde_json::Value>,
}

impl StepOutput {
    /// Capture a value: records its type token and serializes it
    pub fn of<T: Serialize + 'static>(value: &T) -> Result<Self, StateError> {
        let serialized = serde_json::to_string(value)
            .map_err(|e| StateError::Serialization(e.to_string()))?;
        Ok(Self {
            serialized: Some(serialized),
            type_token: Some(TypeToken::of::<T>()),
            decoded: OnceLock::new(),
        })
    }

    /// An output with no value
    pub fn empty() -> Self {
        Self {
            serialized: None,
            type_token: None,
            decoded: OnceLock::new(),
        }
    }

    /// Whether a value is present
    pub fn has_value(&self) -> bool {
        self.serialized.is_some() && self.type_token.is_some()
    }

    /// The captured type token, if any
    pub fn type_token(&self) -> Option<&TypeToken> {
        self.type_token.as_ref()
    }

    /// The serialized JSON text, if any
    pub fn serialized(&self) -> Option<&str> {
        self.serialized.as_deref()
    }

    /// The decoded JSON value (lazily parsed, cached)
    pub fn json(&self) -> Result<&serde_json::Value, StateError> {
        let raw = self.serialized.as_deref().ok_or(StateError::Empty)?;
        if let Some(v) = self.decoded.get() {
            return Ok(v);
        }
        let parsed: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| StateError::Serialization(e.to_string()))?;
        Ok(self.decoded.get_or_init(|| parsed))
    }

    /// Decode the value as `T`
    ///
    /// Fails when no value is present, when the captured token does not
    /// satisfy `T` (requesting `serde_json::Value` always succeeds), or when
    /// the serialized form cannot be decoded.
    pub fn value<T: DeserializeOwned + 'static>(&self) -> Result<T, StateError> {
        let token = self.type_token.as_ref().ok_or(StateError::Empty)?;
        let expected = TypeToken::of::<T>();
        if !expected.is_value() && !token.is_value() && *token != expected {
            return Err(StateError::TypeMismatch {
                expected: expected.name().to_string(),
                found: token.name().to_string(),
            });
        }
        let json = self.json()?;
        serde_json::from_value(json.clone())
            .map_err(|e| StateError::Serialization(e.to_string()))
    }

    /// Whether the captured type is acceptable where `expected` is declared
    pub fn is_compatible_with(&self, expected: &TypeToken) -> bool {
        match &self.type_token {
            Some(token) => expected.accepts(token),
            None => false,
        }
    }

    /// Whether the serialized form decodes cleanly via the given probe
    ///
    /// Used for the resume-input "cast" rule: the erased layer cannot name
    /// the target type, so the graph carries a decode probe per step.
    pub fn probe_with(&self, probe: &dyn Fn(&str) -> bool) -> bool {
        self.serialized.as_deref().map(probe).unwrap_or(false)
    }
}

impl PartialEq for StepOutput {
    fn eq(&self, other: &Self) -> bool {
        self.serialized == other.serialized && self.type_token == other.type_token
    }
}
