use crate::expr::ExprError;
use crate::execution::ErrorKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("Workflow not found: {0}")]
    NotFound(String),

    #[error("Invalid workflow: {0}")]
    Invalid(String),

    #[error("No executor registered for step kind '{kind}' (step '{step_id}')")]
    UnknownStepKind { step_id: String, kind: String },
}

/// Structural problems with a definition's dependency graph. Always fatal and
/// always raised before any step runs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("Duplicate step id: '{0}'")]
    DuplicateStep(String),

    #[error("Step '{step_id}' depends on unknown step '{dependency}'")]
    DanglingDependency { step_id: String, dependency: String },

    #[error("Cyclic dependency between steps: {}", .steps.join(", "))]
    Cycle { steps: Vec<String> },

    #[error("Condition '{condition}' gates step '{target}', which does not depend on it")]
    InvalidBranch { condition: String, target: String },

    #[error("Step '{step_id}' references '${reference}', which is not upstream of it")]
    UnreachableReference { step_id: String, reference: String },
}

/// Input binding failures. Local to the step whose inputs were being resolved.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    #[error("Template '{template}': step '{step}' has not completed")]
    StepNotCompleted { template: String, step: String },

    #[error("Template '{template}': missing segment '{segment}'")]
    MissingSegment { template: String, segment: String },

    #[error("Malformed template '{template}': {reason}")]
    Malformed { template: String, reason: String },
}

/// Failures raised by an executor while running one step.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutorError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Request failed: {0}")]
    Request(String),

    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("Malformed output: {0}")]
    MalformedOutput(String),

    #[error("Evaluation failed: {0}")]
    Evaluation(#[from] ExprError),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Unknown step kind: {0}")]
    UnknownKind(String),

    #[error("Timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Cancelled")]
    Cancelled,
}

/// Why a single step failed, as recorded on the execution.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StepError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

impl StepError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StepError::Template(_) => ErrorKind::Template,
            StepError::Executor(ExecutorError::Template(_)) => ErrorKind::Template,
            StepError::Executor(_) => ErrorKind::Executor,
        }
    }
}
