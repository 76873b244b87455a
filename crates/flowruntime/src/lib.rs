//! Workflow execution runtime
//!
//! This crate provides the engine that runs workflows: the dependency graph
//! resolver, the executor registry, the wave-by-wave orchestration loop and
//! the bounded execution ledger.

mod executor;
mod graph;
mod registry;
mod runtime;
mod store;

pub use executor::WorkflowExecutor;
pub use graph::{plan_waves, ExecutionPlan};
pub use registry::{ExecutorMetadata, ExecutorRegistry, DEFAULT_PARALLEL_LIMIT};
pub use runtime::{DefinitionRegistry, FlowRuntime, InMemoryDefinitions, RuntimeConfig};
pub use store::{ExecutionStore, StoreStats, DEFAULT_LEDGER_CAPACITY};
