use async_trait::async_trait;
use flowcore::expr::Expression;
use flowcore::{ConditionConfig, ExecutorError, StepContext, StepExecutor, StepKind, StepSpec, Value};

/// `condition`: evaluate a boolean expression and report the active branch.
///
/// Output is `{result, branch}` with `branch` either `"then"` or `"else"`.
/// The engine skips the steps listed under the other branch.
pub struct ConditionExecutor;

#[async_trait]
impl StepExecutor for ConditionExecutor {
    fn kind(&self) -> &str {
        StepKind::CONDITION
    }

    fn description(&self) -> &str {
        "Choose between two continuation branches"
    }

    fn validate(&self, step: &StepSpec) -> Result<(), ExecutorError> {
        let config = config_of(&step.kind)?;
        Expression::parse(&config.expr)?;
        if let Some(both) = config
            .then_steps
            .iter()
            .find(|id| config.else_steps.contains(id))
        {
            return Err(ExecutorError::Configuration(format!(
                "step '{}' is listed under both branches",
                both
            )));
        }
        Ok(())
    }

    async fn execute(&self, ctx: StepContext) -> Result<Value, ExecutorError> {
        let config = config_of(&ctx.kind)?;
        let result = match Expression::parse(&config.expr)?.evaluate(&ctx.inputs)? {
            Value::Bool(b) => b,
            other => {
                return Err(ExecutorError::InvalidInputType {
                    field: "expr".to_string(),
                    expected: "boolean".to_string(),
                    actual: other.type_name().to_string(),
                })
            }
        };

        let branch = if result { "then" } else { "else" };
        tracing::debug!(step_id = %ctx.step_id, "Condition took '{}' branch", branch);

        Ok(Value::object([
            ("result", Value::Bool(result)),
            ("branch", Value::from(branch)),
        ]))
    }
}

fn config_of(kind: &StepKind) -> Result<&ConditionConfig, ExecutorError> {
    match kind {
        StepKind::Condition(config) => Ok(config),
        other => Err(ExecutorError::Configuration(format!(
            "expected condition config, got {}",
            other.name()
        ))),
    }
}
