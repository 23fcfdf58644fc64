//! Schema provider for suspension input types
//!
//! When a suspension declares its expected resumption input, the
//! orchestrator registers that type's schema here so outer surfaces can
//! render input forms. Suspensions may carry an explicit JSON schema;
//! otherwise a minimal one is derived from the type token.

use dashmap::DashMap;

use crate::state::TypeToken;

/// Source of JSON schemas for resumption input types
pub trait SchemaProvider: Send + Sync {
    /// Register a type, preferring the explicit schema when given.
    /// Returns the schema id.
    fn register(&self, token: &TypeToken, schema: Option<&serde_json::Value>) -> String;

    /// The schema for a type (generated and cached on first use)
    fn generate_schema(&self, token: &TypeToken) -> serde_json::Value;

    /// Stable schema id for a type
    fn schema_id(&self, token: &TypeToken) -> String;
}

fn fallback_schema(token: &TypeToken) -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "title": token.short_name(),
    })
}

fn id_for(token: &TypeToken) -> String {
    token.short_name().to_string()
}

/// Reference provider caching schemas by type identity
#[derive(Debug, Default)]
pub struct CachingSchemaProvider {
    cache: DashMap<TypeToken, serde_json::Value>,
}

impl CachingSchemaProvider {
    /// Create an empty provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached schemas
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl SchemaProvider for CachingSchemaProvider {
    fn register(&self, token: &TypeToken, schema: Option<&serde_json::Value>) -> String {
        match schema {
            Some(explicit) => {
                self.cache.insert(token.clone(), explicit.clone());
            }
            None => {
                self.cache
                    .entry(token.clone())
                    .or_insert_with(|| fallback_schema(token));
            }
        }
        id_for(token)
    }

    fn generate_schema(&self, token: &TypeToken) -> serde_json::Value {
        self.cache
            .entry(token.clone())
            .or_insert_with(|| fallback_schema(token))
            .clone()
    }

    fn schema_id(&self, token: &TypeToken) -> String {
        id_for(token)
    }
}
