use crate::graph::{plan_waves, ExecutionPlan};
use crate::registry::{ExecutorRegistry, DEFAULT_PARALLEL_LIMIT};
use crate::store::{ExecutionStore, StoreStats, DEFAULT_LEDGER_CAPACITY};
use crate::WorkflowExecutor;
use async_trait::async_trait;
use flowcore::{
    EventBus, ExecutionEvent, ExecutionId, FlowError, Value, WorkflowDefinition, WorkflowError,
    WorkflowExecution, WorkflowId,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};

/// Where `execute_workflow` looks definitions up.
#[async_trait]
pub trait DefinitionRegistry: Send + Sync {
    async fn lookup(&self, workflow_id: &str) -> Option<WorkflowDefinition>;

    async fn store(&self, definition: WorkflowDefinition) -> Result<(), FlowError>;

    async fn list(&self) -> Vec<WorkflowDefinition>;

    async fn remove(&self, workflow_id: &str) -> Option<WorkflowDefinition>;
}

/// Process-local definition registry.
#[derive(Default)]
pub struct InMemoryDefinitions {
    workflows: RwLock<HashMap<WorkflowId, WorkflowDefinition>>,
}

impl InMemoryDefinitions {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DefinitionRegistry for InMemoryDefinitions {
    async fn lookup(&self, workflow_id: &str) -> Option<WorkflowDefinition> {
        self.workflows.read().await.get(workflow_id).cloned()
    }

    async fn store(&self, definition: WorkflowDefinition) -> Result<(), FlowError> {
        self.workflows
            .write()
            .await
            .insert(definition.id.clone(), definition);
        Ok(())
    }

    async fn list(&self) -> Vec<WorkflowDefinition> {
        let mut all: Vec<_> = self.workflows.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    async fn remove(&self, workflow_id: &str) -> Option<WorkflowDefinition> {
        self.workflows.write().await.remove(workflow_id)
    }
}

/// Main runtime for executing workflows
pub struct FlowRuntime {
    registry: Arc<ExecutorRegistry>,
    executor: Arc<WorkflowExecutor>,
    event_bus: Arc<EventBus>,
    store: Arc<ExecutionStore>,
    definitions: Arc<dyn DefinitionRegistry>,
}

impl FlowRuntime {
    /// Create a runtime with no executors and default settings
    pub fn new() -> Self {
        Self::with_registry(ExecutorRegistry::new(), RuntimeConfig::default())
    }

    /// Create a new runtime with a pre-configured registry
    pub fn with_registry(registry: ExecutorRegistry, config: RuntimeConfig) -> Self {
        Self::with_definitions(registry, config, Arc::new(InMemoryDefinitions::new()))
    }

    pub fn with_definitions(
        mut registry: ExecutorRegistry,
        config: RuntimeConfig,
        definitions: Arc<dyn DefinitionRegistry>,
    ) -> Self {
        registry.set_parallel_limit(config.parallel_branch_limit);
        let executor = WorkflowExecutor::new(config.max_parallel_steps)
            .with_default_timeout(config.default_timeout);

        Self {
            registry: Arc::new(registry),
            executor: Arc::new(executor),
            event_bus: Arc::new(EventBus::new(config.event_buffer_size)),
            store: Arc::new(ExecutionStore::new(config.ledger_capacity)),
            definitions,
        }
    }

    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.registry
    }

    /// Check the graph and that every step kind has an executor.
    pub fn validate(&self, definition: &WorkflowDefinition) -> Result<ExecutionPlan, FlowError> {
        let plan = plan_waves(&definition.steps)?;
        self.registry.validate(definition)?;
        Ok(plan)
    }

    /// Validate and store a definition for `execute_workflow`.
    pub async fn register_workflow(&self, definition: WorkflowDefinition) -> Result<(), FlowError> {
        self.validate(&definition)?;
        tracing::info!("Registering workflow: {}", definition.id);
        self.definitions.store(definition).await
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> Option<WorkflowDefinition> {
        self.definitions.lookup(workflow_id).await
    }

    pub async fn list_workflows(&self) -> Vec<WorkflowDefinition> {
        self.definitions.list().await
    }

    pub async fn remove_workflow(&self, workflow_id: &str) -> Option<WorkflowDefinition> {
        self.definitions.remove(workflow_id).await
    }

    /// Execute a registered workflow by id.
    ///
    /// Only an unknown id is an `Err`; every other problem is reported in the
    /// returned record.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        inputs: BTreeMap<String, Value>,
    ) -> Result<Arc<WorkflowExecution>, FlowError> {
        let definition = self
            .definitions
            .lookup(workflow_id)
            .await
            .ok_or_else(|| WorkflowError::NotFound(workflow_id.to_string()))?;
        Ok(self.execute(&definition, inputs).await)
    }

    /// Execute a definition directly (without registration)
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        inputs: BTreeMap<String, Value>,
    ) -> Arc<WorkflowExecution> {
        let execution = self
            .executor
            .execute(definition, self.registry.clone(), &self.event_bus, inputs)
            .await;
        self.store.record(execution).await
    }

    pub async fn get_execution(&self, id: &ExecutionId) -> Option<Arc<WorkflowExecution>> {
        self.store.get(id).await
    }

    pub async fn list_recent(&self, limit: usize) -> Vec<Arc<WorkflowExecution>> {
        self.store.list_recent(limit).await
    }

    pub async fn list_by_workflow(
        &self,
        workflow_id: &str,
        limit: usize,
    ) -> Vec<Arc<WorkflowExecution>> {
        self.store.list_by_workflow(workflow_id, limit).await
    }

    pub async fn stats(&self) -> StoreStats {
        self.store.stats().await
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    /// Get the event bus for direct access
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }
}

impl Default for FlowRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Concurrent steps per wave.
    pub max_parallel_steps: usize,
    /// Concurrent branches inside one `parallel` step.
    pub parallel_branch_limit: usize,
    pub event_buffer_size: usize,
    pub ledger_capacity: usize,
    /// Deadline for workflows that do not set `settings.timeout_ms`.
    pub default_timeout: Option<Duration>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: 10,
            parallel_branch_limit: DEFAULT_PARALLEL_LIMIT,
            event_buffer_size: 1000,
            ledger_capacity: DEFAULT_LEDGER_CAPACITY,
            default_timeout: None,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `FLOW_*` environment variables. Unparseable
    /// values fall back to the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_parallel_steps: env_or("FLOW_MAX_PARALLEL_STEPS", defaults.max_parallel_steps),
            parallel_branch_limit: env_or(
                "FLOW_PARALLEL_BRANCH_LIMIT",
                defaults.parallel_branch_limit,
            ),
            event_buffer_size: env_or("FLOW_EVENT_BUFFER", defaults.event_buffer_size),
            ledger_capacity: env_or("FLOW_LEDGER_CAPACITY", defaults.ledger_capacity),
            default_timeout: std::env::var("FLOW_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .or(defaults.default_timeout),
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring invalid {}={}", name, raw);
            default
        }),
        Err(_) => default,
    }
}
