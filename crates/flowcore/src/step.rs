use crate::template::{self, TemplateScope};
use crate::{EventEmitter, ExecutionId, ExecutorError, StepId, StepKind, StepSpec, Value};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Implementation behind one step kind.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Kind name this executor handles (e.g. "external_call").
    fn kind(&self) -> &str;

    /// Run one step with already-resolved inputs.
    async fn execute(&self, ctx: StepContext) -> Result<Value, ExecutorError>;

    /// Optional: reject a step's config before any step of the run starts.
    fn validate(&self, _step: &StepSpec) -> Result<(), ExecutorError> {
        Ok(())
    }

    /// One-line description for listings.
    fn description(&self) -> &str {
        ""
    }
}

/// Routes a step context to the executor registered for its kind.
///
/// Executors that run nested steps (`parallel`) go back through this instead
/// of knowing about the registry.
#[async_trait]
pub trait StepDispatcher: Send + Sync {
    async fn dispatch(&self, ctx: StepContext) -> Result<Value, ExecutorError>;

    /// Upper bound on concurrently running nested steps.
    fn parallel_limit(&self) -> usize;

    /// Permits shared by every nested branch that does work itself, across
    /// all `parallel` steps and nesting levels. Holds `parallel_limit` permits.
    fn branch_permits(&self) -> Arc<Semaphore>;
}

/// Everything an executor sees for one step.
#[derive(Clone)]
pub struct StepContext {
    pub execution_id: ExecutionId,
    pub step_id: StepId,
    pub kind: StepKind,
    /// The step's `inputs` after template resolution.
    pub inputs: BTreeMap<String, Value>,
    /// Input bag and completed step outputs, for executors that resolve
    /// templates inside their own config.
    pub scope: Arc<TemplateScope>,
    pub events: EventEmitter,
    /// Fires when the invocation deadline expires.
    pub cancellation: CancellationToken,
    pub dispatcher: Arc<dyn StepDispatcher>,
}

impl StepContext {
    /// Get required input or return error
    pub fn require_input(&self, name: &str) -> Result<&Value, ExecutorError> {
        self.inputs
            .get(name)
            .ok_or_else(|| ExecutorError::MissingInput(name.to_string()))
    }

    pub fn input_str(&self, name: &str) -> Option<&str> {
        self.inputs.get(name).and_then(Value::as_str)
    }

    /// Resolve templates in a config string (`${...}` interpolation or a whole
    /// `$ref`), rendering the result as text.
    pub fn render(&self, text: &str) -> Result<String, ExecutorError> {
        Ok(template::resolve(text, &self.scope)?.to_display_string())
    }

    /// Resolve templates in a config value, keeping types.
    pub fn resolve(&self, value: &Value) -> Result<Value, ExecutorError> {
        Ok(template::resolve_value(value, &self.scope)?)
    }

    /// Context for a nested step run under this one. The nested step's inputs
    /// are resolved against the same scope.
    pub fn nested(&self, step: &StepSpec) -> Result<StepContext, ExecutorError> {
        let inputs = template::resolve_inputs(&step.inputs, &self.scope)?;
        Ok(StepContext {
            execution_id: self.execution_id,
            step_id: format!("{}/{}", self.step_id, step.id),
            kind: step.kind.clone(),
            inputs,
            scope: Arc::clone(&self.scope),
            events: self.events.child(&step.id),
            cancellation: self.cancellation.child_token(),
            dispatcher: Arc::clone(&self.dispatcher),
        })
    }
}
