//! Mutable per-instance workflow context

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::reliability::RetryContext;

use super::output::{StateError, StepOutput, TypeToken};

/// Reserved key: the workflow's final result
pub const FINAL_OUTPUT_KEY: &str = "__final__";

/// Reserved key: the pending resumption value
pub const USER_INPUT_KEY: &str = "__userInput__";

/// Reserved key: the type name of the pending resumption value
pub const USER_INPUT_TYPE_KEY: &str = "__userInputType__";

/// Reserved key: the original input of the suspended step
pub const RESUMED_STEP_INPUT_KEY: &str = "__resumedStepInput__";

/// Reserved key: marker set while a future-based async step is in flight
pub const ASYNC_FUTURE_KEY: &str = "__asyncFuture__";

/// Per-instance mutable state: trigger data, step outputs in insertion
/// order, per-step retry contexts and execution counts
///
/// The context is exclusively owned by its instance and serialized with it,
/// so everything here round-trips through serde.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowContext {
    run_id: String,
    trigger: StepOutput,
    outputs: Vec<(String, StepOutput)>,

    #[serde(default)]
    retry_contexts: HashMap<String, RetryContext>,

    #[serde(default)]
    execution_counts: HashMap<String, u32>,
}

impl WorkflowContext {
    /// Create a fresh context for a run
    pub fn new(run_id: impl Into<String>, trigger: StepOutput) -> Self {
        Self {
            run_id: run_id.into(),
            trigger,
            outputs: Vec::new(),
            retry_contexts: HashMap::new(),
            execution_counts: HashMap::new(),
        }
    }

    /// The instance's run id
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The input the workflow was started with
    pub fn trigger_data(&self) -> &StepOutput {
        &self.trigger
    }

    /// Store a step output under a key, moving it to the most-recent slot
    pub fn set_output(&mut self, key: impl Into<String>, output: StepOutput) {
        let key = key.into();
        self.outputs.retain(|(k, _)| *k != key);
        self.outputs.push((key, output));
    }

    /// Look up an output by key
    pub fn output(&self, key: &str) -> Option<&StepOutput> {
        self.outputs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Remove an output by key
    pub fn remove_output(&mut self, key: &str) -> Option<StepOutput> {
        let idx = self.outputs.iter().position(|(k, _)| k == key)?;
        Some(self.outputs.remove(idx).1)
    }

    /// All outputs in insertion order (oldest first)
    pub fn outputs(&self) -> impl Iterator<Item = (&str, &StepOutput)> {
        self.outputs.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Whether any step output has been recorded yet (reserved keys included)
    pub fn has_outputs(&self) -> bool {
        !self.outputs.is_empty()
    }

    /// Decode an output by key
    pub fn output_value<T: serde::de::DeserializeOwned + 'static>(
        &self,
        key: &str,
    ) -> Result<T, StateError> {
        self.output(key).ok_or(StateError::Empty)?.value::<T>()
    }

    /// Bump and return the execution count for a step
    pub fn increment_execution_count(&mut self, step_id: &str) -> u32 {
        let count = self.execution_counts.entry(step_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Current execution count for a step
    pub fn execution_count(&self, step_id: &str) -> u32 {
        self.execution_counts.get(step_id).copied().unwrap_or(0)
    }

    /// Retry context for a step, if one has been recorded
    pub fn retry_context(&self, step_id: &str) -> Option<&RetryContext> {
        self.retry_contexts.get(step_id)
    }

    /// Record the retry context for a step
    pub fn set_retry_context(&mut self, step_id: impl Into<String>, ctx: RetryContext) {
        self.retry_contexts.insert(step_id.into(), ctx);
    }

    /// Record a pending resumption value and its type
    pub fn set_user_input(&mut self, value: StepOutput, token: &TypeToken) -> Result<(), StateError> {
        let type_name = token.name().to_string();
        self.set_output(USER_INPUT_KEY, value);
        self.set_output(USER_INPUT_TYPE_KEY, StepOutput::of(&type_name)?);
        Ok(())
    }

    /// The type token of the pending resumption value, if any
    pub fn user_input_token(&self) -> Option<TypeToken> {
        let name = self
            .output(USER_INPUT_TYPE_KEY)?
            .value::<String>()
            .ok()?;
        Some(TypeToken::named(name))
    }

    /// Consume the pending resumption value (removes both reserved keys)
    pub fn take_user_input(&mut self) -> Option<(StepOutput, Option<TypeToken>)> {
        let token = self.user_input_token();
        let value = self.remove_output(USER_INPUT_KEY)?;
        self.remove_output(USER_INPUT_TYPE_KEY);
        Some((value, token))
    }

    /// Store the workflow's final result
    pub fn set_final_output(&mut self, output: StepOutput) {
        self.set_output(FINAL_OUTPUT_KEY, output);
    }

    /// The workflow's final result, if finished
    pub fn final_output(&self) -> Option<&StepOutput> {
        self.output(FINAL_OUTPUT_KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> WorkflowContext {
        WorkflowContext::new("run-1", StepOutput::of(&10i64).unwrap())
    }

    #[test]
    fn test_outputs_keep_insertion_order() {
        let mut ctx = ctx();
        ctx.set_output("a", StepOutput::of(&1i64).unwrap());
        ctx.set_output("b", StepOutput::of(&2i64).unwrap());
        ctx.set_output("c", StepOutput::of(&3i64).unwrap());

        let keys: Vec<_> = ctx.outputs().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_rewriting_a_key_moves_it_to_most_recent() {
        let mut ctx = ctx();
        ctx.set_output("a", StepOutput::of(&1i64).unwrap());
        ctx.set_output("b", StepOutput::of(&2i64).unwrap());
        ctx.set_output("a", StepOutput::of(&9i64).unwrap());

        let keys: Vec<_> = ctx.outputs().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(ctx.output_value::<i64>("a").unwrap(), 9);
    }

    #[test]
    fn test_execution_counts() {
        let mut ctx = ctx();
        assert_eq!(ctx.execution_count("s"), 0);
        assert_eq!(ctx.increment_execution_count("s"), 1);
        assert_eq!(ctx.increment_execution_count("s"), 2);
        assert_eq!(ctx.execution_count("s"), 2);
    }

    #[test]
    fn test_user_input_round_trip() {
        let mut ctx = ctx();
        let token = TypeToken::of::<String>();
        ctx.set_user_input(StepOutput::of(&"Alice".to_string()).unwrap(), &token)
            .unwrap();

        assert_eq!(ctx.user_input_token(), Some(token.clone()));

        let (value, taken_token) = ctx.take_user_input().unwrap();
        assert_eq!(value.value::<String>().unwrap(), "Alice");
        assert_eq!(taken_token, Some(token));

        // both reserved keys are gone
        assert!(ctx.output(USER_INPUT_KEY).is_none());
        assert!(ctx.output(USER_INPUT_TYPE_KEY).is_none());
    }

    #[test]
    fn test_serde_round_trip() {
        let mut ctx = ctx();
        ctx.set_output("a", StepOutput::of(&1i64).unwrap());
        ctx.increment_execution_count("a");

        let json = serde_json::to_string(&ctx).unwrap();
        let back: WorkflowContext = serde_json::from_str(&json).unwrap();

        assert_eq!(back.run_id(), "run-1");
        assert_eq!(back.output_value::<i64>("a").unwrap(), 1);
        assert_eq!(back.execution_count("a"), 1);
    }
}
