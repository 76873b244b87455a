//! Core abstractions for the flow engine
//!
//! This crate provides the fundamental types and traits that all other
//! components depend on: workflow definitions, the execution record, the
//! error taxonomy, template resolution, the transform expression language
//! and the executor seam.

mod error;
pub mod events;
mod execution;
pub mod expr;
mod step;
pub mod template;
mod value;
mod workflow;

pub use error::{ExecutorError, FlowError, GraphError, StepError, TemplateError, WorkflowError};
pub use events::*;
pub use execution::{
    ErrorKind, ExecutionErrorEntry, ExecutionId, ExecutionStatus, StepStatus, WorkflowExecution,
};
pub use step::{StepContext, StepDispatcher, StepExecutor};
pub use template::TemplateScope;
pub use value::Value;
pub use workflow::{
    ConditionConfig, ErrorHandling, ExternalCallConfig, GenerativeTextConfig, ParallelConfig,
    ResponseFormat, RetryPolicy, StepId, StepKind, StepSpec, TransformConfig, TriggerSpec,
    TriggerType, WorkflowDefinition, WorkflowId, WorkflowSettings,
};

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
