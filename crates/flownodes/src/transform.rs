use async_trait::async_trait;
use flowcore::expr::Expression;
use flowcore::{ExecutorError, StepContext, StepExecutor, StepKind, StepSpec, Value};

/// `transform`: evaluate a sandboxed expression over the resolved inputs.
///
/// Object results are returned as-is; anything else is wrapped as
/// `{value: ...}` so step outputs are always objects.
pub struct TransformExecutor;

#[async_trait]
impl StepExecutor for TransformExecutor {
    fn kind(&self) -> &str {
        StepKind::TRANSFORM
    }

    fn description(&self) -> &str {
        "Reshape data with a pure expression"
    }

    fn validate(&self, step: &StepSpec) -> Result<(), ExecutorError> {
        Expression::parse(expr_of(&step.kind)?)?;
        Ok(())
    }

    async fn execute(&self, ctx: StepContext) -> Result<Value, ExecutorError> {
        let expression = Expression::parse(expr_of(&ctx.kind)?)?;
        match expression.evaluate(&ctx.inputs)? {
            object @ Value::Object(_) => Ok(object),
            other => Ok(Value::object([("value", other)])),
        }
    }
}

fn expr_of(kind: &StepKind) -> Result<&str, ExecutorError> {
    match kind {
        StepKind::Transform(config) => Ok(&config.expr),
        other => Err(ExecutorError::Configuration(format!(
            "expected transform config, got {}",
            other.name()
        ))),
    }
}
