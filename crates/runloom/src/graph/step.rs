//! Step definitions and the erased executor seam
//!
//! User code writes typed closures; the definition erases them behind a
//! handler taking the durable [`StepOutput`] form, capturing the input and
//! output type tokens for routing on the way.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::reliability::RetryPolicy;
use crate::state::{
    ErrorKind, StateError, StepFailure, StepOutput, StepResult, TypeToken, WorkflowContext,
};

/// Default per-step invocation limit within one instance
pub const DEFAULT_INVOCATION_LIMIT: u32 = 100;

/// Boxed future returned by a step executor
pub type StepFuture = Pin<Box<dyn Future<Output = Result<StepResult, StepFailure>> + Send>>;

/// Erased step executor: durable input in, control outcome out
pub type StepHandler = Arc<dyn Fn(Option<StepOutput>, StepContext) -> StepFuture + Send + Sync>;

/// Probe deciding whether a serialized value decodes into the step's input
/// type (used for the resume-input cast rule)
pub type InputProbe = Arc<dyn Fn(&StepOutput) -> bool + Send + Sync>;

/// What to do when a step exceeds its invocation limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnInvocationLimit {
    /// Fail the instance
    #[default]
    Error,

    /// Finish the workflow with an empty result
    Stop,

    /// Keep executing, with a warning
    Continue,
}

/// Per-step configuration attached at graph-build time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    /// Maximum executions of this step within one instance
    pub invocation_limit: u32,

    /// Behavior when the limit is exceeded
    pub on_invocation_limit: OnInvocationLimit,

    /// Retry policy, when the step opts into retries
    pub retry_policy: Option<RetryPolicy>,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            invocation_limit: DEFAULT_INVOCATION_LIMIT,
            on_invocation_limit: OnInvocationLimit::default(),
            retry_policy: None,
        }
    }
}

/// Read view handed to a step executor alongside its input
#[derive(Debug, Clone)]
pub struct StepContext {
    run_id: String,
    step_id: String,
    attempt: u32,
    context: WorkflowContext,
}

impl StepContext {
    /// Build a context snapshot for one execution attempt
    pub fn new(step_id: impl Into<String>, attempt: u32, context: WorkflowContext) -> Self {
        Self {
            run_id: context.run_id().to_string(),
            step_id: step_id.into(),
            attempt,
            context,
        }
    }

    /// The instance's run id
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The executing step's id
    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    /// Current attempt number (1-based)
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The workflow context snapshot
    pub fn context(&self) -> &WorkflowContext {
        &self.context
    }

    /// Decode the workflow's trigger data
    pub fn trigger<T: DeserializeOwned + 'static>(&self) -> Result<T, StateError> {
        self.context.trigger_data().value::<T>()
    }

    /// Decode a prior step's output
    pub fn step_output<T: DeserializeOwned + 'static>(&self, step_id: &str) -> Result<T, StateError> {
        self.context.output_value::<T>(step_id)
    }
}

/// Decode the erased input for a typed handler
///
/// A missing input or an undecodable body is a type error at execution
/// time: the step still ran, the input just never resolved. A token
/// mismatch falls back to a raw decode, the cast path used when a
/// resumption value is shaped right but typed differently.
fn decode_input<I: DeserializeOwned + 'static>(
    input: Option<&StepOutput>,
    step_id: &str,
) -> Result<I, StepFailure> {
    let output = input.ok_or_else(|| {
        StepFailure::new(format!("no input resolved for step '{step_id}'"))
            .with_type("TypeMismatchError")
            .with_kind(ErrorKind::TypeMismatch)
    })?;

    match output.value::<I>() {
        Ok(v) => Ok(v),
        Err(StateError::TypeMismatch { expected, found }) => {
            let raw = output.serialized().ok_or_else(|| {
                StepFailure::new(format!("empty input for step '{step_id}'"))
                    .with_kind(ErrorKind::TypeMismatch)
            })?;
            serde_json::from_str(raw).map_err(|_| {
                StepFailure::new(format!(
                    "step '{step_id}' expected input {expected}, got {found}"
                ))
                .with_type("TypeMismatchError")
                .with_kind(ErrorKind::TypeMismatch)
            })
        }
        Err(e) => Err(StepFailure::from(e)),
    }
}

fn probe_for<I: DeserializeOwned + 'static>() -> InputProbe {
    Arc::new(|output: &StepOutput| {
        output
            .serialized()
            .map(|raw| serde_json::from_str::<I>(raw).is_ok())
            .unwrap_or(false)
    })
}

/// A step waiting to be assembled into a graph
///
/// # Example
///
/// ```
/// use runloom::graph::StepDefinition;
/// use runloom::state::StepResult;
///
/// // value handler, auto-wrapped into Continue
/// let double = StepDefinition::value("double", |n: i64, _ctx| async move { Ok(n * 2) });
///
/// // result handler, chooses its own control outcome
/// let format = StepDefinition::of("format", |n: i64, _ctx| async move {
///     StepResult::finish(n.to_string()).map_err(Into::into)
/// })
/// .returning::<String>();
///
/// assert_eq!(double.id(), "double");
/// assert_eq!(format.id(), "format");
/// ```
#[derive(Clone)]
pub struct StepDefinition {
    id: String,
    input: TypeToken,
    output: TypeToken,
    handler: StepHandler,
    probe: InputProbe,
    config: StepConfig,
}

impl StepDefinition {
    /// Define a step from a typed handler returning a [`StepResult`]
    ///
    /// The input type is inferred from the closure's first parameter; the
    /// output type defaults to the dynamic value and can be narrowed with
    /// [`returning`](Self::returning).
    pub fn of<I, F, Fut>(id: impl Into<String>, handler: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        F: Fn(I, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepResult, StepFailure>> + Send + 'static,
    {
        let id = id.into();
        let erased: StepHandler = Arc::new(move |input, ctx: StepContext| {
            match decode_input::<I>(input.as_ref(), ctx.step_id()) {
                Ok(decoded) => Box::pin(handler(decoded, ctx)) as StepFuture,
                Err(e) => Box::pin(async move { Err(e) }) as StepFuture,
            }
        });
        Self {
            id,
            input: TypeToken::of::<I>(),
            output: TypeToken::value(),
            handler: erased,
            probe: probe_for::<I>(),
            config: StepConfig::default(),
        }
    }

    /// Define a step from a plain value handler, auto-wrapped into `Continue`
    ///
    /// Both the input and output types are inferred.
    pub fn value<I, O, F, Fut>(id: impl Into<String>, handler: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(I, StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, StepFailure>> + Send + 'static,
    {
        let id = id.into();
        let erased: StepHandler = Arc::new(move |input, ctx: StepContext| {
            match decode_input::<I>(input.as_ref(), ctx.step_id()) {
                Ok(decoded) => {
                    let fut = handler(decoded, ctx);
                    Box::pin(async move {
                        let value = fut.await?;
                        StepResult::next(value).map_err(Into::into)
                    }) as StepFuture
                }
                Err(e) => Box::pin(async move { Err(e) }) as StepFuture,
            }
        });
        Self {
            id,
            input: TypeToken::of::<I>(),
            output: TypeToken::of::<O>(),
            handler: erased,
            probe: probe_for::<I>(),
            config: StepConfig::default(),
        }
    }

    /// Define a step from pre-erased parts (synthetic builder nodes)
    pub(crate) fn raw(
        id: impl Into<String>,
        input: TypeToken,
        output: TypeToken,
        handler: StepHandler,
        probe: InputProbe,
    ) -> Self {
        Self {
            id: id.into(),
            input,
            output,
            handler,
            probe,
            config: StepConfig::default(),
        }
    }

    /// Declare the step's output type
    pub fn returning<O: 'static>(mut self) -> Self {
        self.output = TypeToken::of::<O>();
        self
    }

    /// Attach a retry policy
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry_policy = Some(policy);
        self
    }

    /// Set the invocation limit (clamped to ≥ 1)
    pub fn with_invocation_limit(mut self, limit: u32) -> Self {
        self.config.invocation_limit = limit.max(1);
        self
    }

    /// Set the behavior when the invocation limit is exceeded
    pub fn on_invocation_limit(mut self, behavior: OnInvocationLimit) -> Self {
        self.config.on_invocation_limit = behavior;
        self
    }

    /// The step id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Declared input type
    pub fn input(&self) -> &TypeToken {
        &self.input
    }

    /// Declared output type
    pub fn output(&self) -> &TypeToken {
        &self.output
    }

    /// Per-step configuration
    pub fn config(&self) -> &StepConfig {
        &self.config
    }

    pub(crate) fn into_parts(self) -> (String, TypeToken, TypeToken, StepHandler, InputProbe, StepConfig) {
        (
            self.id,
            self.input,
            self.output,
            self.handler,
            self.probe,
            self.config,
        )
    }
}

impl std::fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDefinition")
            .field("id", &self.id)
            .field("input", &self.input)
            .field("output", &self.output)
            .field("config", &self.config)
            .finish()
    }
}
