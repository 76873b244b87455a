//! Standard executor library
//!
//! Built-in implementations for the five step kinds.

mod condition;
mod generate;
mod http;
mod parallel;
mod transform;

pub use condition::ConditionExecutor;
pub use generate::{
    GenerationConfig, GenerationRequest, GenerationResponse, GenerativeTextExecutor,
    OpenAiCompatibleGenerator, TextGenerator,
};
pub use http::ExternalCallExecutor;
pub use parallel::{ParallelExecutor, ERRORS_KEY};
pub use transform::TransformExecutor;
use flowruntime::ExecutorRegistry;

use std::sync::Arc;

/// Register every built-in executor. Text generation uses the
/// OpenAI-compatible backend configured from `FLOW_LLM_*`.
pub fn register_all(registry: &mut ExecutorRegistry) {
    register_with_generator(registry, Arc::new(OpenAiCompatibleGenerator::from_env()));
}

/// Register every built-in executor with a custom generation backend.
pub fn register_with_generator(registry: &mut ExecutorRegistry, generator: Arc<dyn TextGenerator>) {
    registry.register(Arc::new(ExternalCallExecutor::new()));
    registry.register(Arc::new(GenerativeTextExecutor::new(generator)));
    registry.register(Arc::new(TransformExecutor));
    registry.register(Arc::new(ParallelExecutor));
    registry.register(Arc::new(ConditionExecutor));
}
