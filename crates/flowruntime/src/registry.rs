use async_trait::async_trait;
use flowcore::{
    ExecutorError, StepContext, StepDispatcher, StepExecutor, StepKind, StepSpec, Value,
    WorkflowDefinition, WorkflowError,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Default cap on concurrently running branches inside one `parallel` step.
pub const DEFAULT_PARALLEL_LIMIT: usize = 8;

/// Metadata about a registered step kind
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ExecutorMetadata {
    pub kind: String,
    pub description: String,
}

/// Maps step kinds to their executors. Built once per runtime and handed in
/// explicitly, so runtimes with different executor sets can coexist.
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn StepExecutor>>,
    parallel_limit: usize,
    branch_permits: Arc<Semaphore>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
            parallel_limit: DEFAULT_PARALLEL_LIMIT,
            branch_permits: Arc::new(Semaphore::new(DEFAULT_PARALLEL_LIMIT)),
        }
    }

    /// Register an executor, replacing any previous one for the same kind
    pub fn register(&mut self, executor: Arc<dyn StepExecutor>) {
        let kind = executor.kind().to_string();
        tracing::info!("Registering step kind: {}", kind);
        self.executors.insert(kind, executor);
    }

    pub fn set_parallel_limit(&mut self, limit: usize) {
        self.parallel_limit = limit.max(1);
        self.branch_permits = Arc::new(Semaphore::new(self.parallel_limit));
    }

    pub fn get(&self, kind: &str) -> Option<&Arc<dyn StepExecutor>> {
        self.executors.get(kind)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.executors.contains_key(kind)
    }

    /// Get all registered kinds, sorted
    pub fn list_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.executors.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    pub fn get_metadata(&self, kind: &str) -> Option<ExecutorMetadata> {
        self.executors.get(kind).map(|e| ExecutorMetadata {
            kind: kind.to_string(),
            description: e.description().to_string(),
        })
    }

    /// Check that every step, including nested `parallel` branches, has an
    /// executor and a config that executor accepts.
    pub fn validate(&self, definition: &WorkflowDefinition) -> Result<(), WorkflowError> {
        definition
            .steps
            .iter()
            .try_for_each(|step| self.validate_step(step))
    }

    fn validate_step(&self, step: &StepSpec) -> Result<(), WorkflowError> {
        let kind = step.kind.name();
        let executor = self
            .executors
            .get(kind)
            .ok_or_else(|| WorkflowError::UnknownStepKind {
                step_id: step.id.clone(),
                kind: kind.to_string(),
            })?;

        executor
            .validate(step)
            .map_err(|e| WorkflowError::Invalid(format!("step '{}': {}", step.id, e)))?;

        if let StepKind::Parallel(config) = &step.kind {
            for branch in &config.branches {
                self.validate_step(branch)?;
            }
        }
        Ok(())
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepDispatcher for ExecutorRegistry {
    async fn dispatch(&self, ctx: StepContext) -> Result<Value, ExecutorError> {
        let executor = self
            .executors
            .get(ctx.kind.name())
            .ok_or_else(|| ExecutorError::UnknownKind(ctx.kind.name().to_string()))?;
        executor.execute(ctx).await
    }

    fn parallel_limit(&self) -> usize {
        self.parallel_limit
    }

    fn branch_permits(&self) -> Arc<Semaphore> {
        Arc::clone(&self.branch_permits)
    }
}
