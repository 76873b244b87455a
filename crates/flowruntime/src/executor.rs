use crate::graph::{plan_waves, ExecutionPlan};
use crate::registry::ExecutorRegistry;
use chrono::Utc;
use flowcore::template::{self, TemplateScope};
use flowcore::{
    ErrorHandling, ErrorKind, EventBus, ExecutionEvent, ExecutionId, ExecutionStatus,
    ExecutorError, StepContext, StepDispatcher, StepError, StepId, StepKind, StepSpec,
    StepStatus, Value, WorkflowDefinition, WorkflowExecution,
};
use futures::FutureExt;
use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

type TaskOutput = (StepId, Result<Value, ExecutorError>, u64);

/// Runs one workflow invocation as a sequence of waves.
///
/// Steps inside a wave run concurrently; the next wave starts only after the
/// current one has settled.
pub struct WorkflowExecutor {
    max_parallel: usize,
    default_timeout: Option<Duration>,
}

impl WorkflowExecutor {
    pub fn new(max_parallel: usize) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
            default_timeout: None,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Execute a definition and return its terminal execution record.
    ///
    /// Never fails: graph and configuration problems produce a `failed`
    /// record with a single error entry and no step statuses.
    #[instrument(skip_all, fields(workflow_id = %definition.id))]
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        registry: Arc<ExecutorRegistry>,
        event_bus: &EventBus,
        inputs: BTreeMap<String, Value>,
    ) -> WorkflowExecution {
        let mut execution = WorkflowExecution::new(definition.id.clone());
        let execution_id = execution.id;
        let started = Instant::now();

        event_bus.emit(ExecutionEvent::WorkflowStarted {
            execution_id,
            workflow_id: definition.id.clone(),
            timestamp: Utc::now(),
        });

        tracing::info!(%execution_id, "Starting workflow execution: {}", definition.id);

        let plan = match self.prepare(definition, &registry) {
            Ok(plan) => plan,
            Err((kind, message)) => {
                tracing::error!(%execution_id, "Workflow {} rejected: {}", definition.id, message);
                execution.record_error(kind, message);
                execution.finish(ExecutionStatus::Failed);
                emit_completed(event_bus, &execution, started);
                return execution;
            }
        };

        for step in &definition.steps {
            execution.set_step_status(step.id.clone(), StepStatus::Pending);
        }
        execution.start();

        let limit = definition
            .settings
            .max_parallel_steps
            .map_or(self.max_parallel, |n| n.min(self.max_parallel))
            .max(1);
        let run = Run {
            definition,
            dispatcher: registry,
            event_bus,
            execution_id,
            semaphore: Arc::new(Semaphore::new(limit)),
            cancellation: CancellationToken::new(),
        };
        let mut state = RunState {
            execution,
            scope: Arc::new(TemplateScope::new(inputs)),
            inactive: HashSet::new(),
            halted: false,
        };

        let deadline = definition
            .settings
            .timeout_ms
            .map(Duration::from_millis)
            .or(self.default_timeout);

        let timed_out = match deadline {
            Some(limit) => tokio::time::timeout(limit, run.waves(&plan, &mut state))
                .await
                .is_err(),
            None => {
                run.waves(&plan, &mut state).await;
                false
            }
        };

        if timed_out {
            run.cancellation.cancel();
            let ms = deadline.map_or(0, |d| d.as_millis() as u64);
            tracing::warn!(%execution_id, "Workflow {} exceeded its {}ms deadline", definition.id, ms);
            run.fail_unfinished(&mut state.execution, ms);
        }

        let mut execution = state.execution;
        let failed = timed_out
            || definition
                .steps
                .iter()
                .any(|s| !s.optional && execution.step_status(&s.id) == Some(StepStatus::Failed));
        execution.finish(if failed {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        });

        tracing::info!(
            %execution_id,
            status = %execution.status,
            completed = execution.count_steps(StepStatus::Completed),
            failed = execution.count_steps(StepStatus::Failed),
            skipped = execution.count_steps(StepStatus::Skipped),
            "Workflow {} finished",
            definition.id
        );
        emit_completed(event_bus, &execution, started);
        execution
    }

    /// Plan waves and check every step kind has an executor.
    pub fn prepare(
        &self,
        definition: &WorkflowDefinition,
        registry: &ExecutorRegistry,
    ) -> Result<ExecutionPlan, (ErrorKind, String)> {
        let plan =
            plan_waves(&definition.steps).map_err(|e| (ErrorKind::Graph, e.to_string()))?;
        registry
            .validate(definition)
            .map_err(|e| (ErrorKind::Configuration, e.to_string()))?;
        Ok(plan)
    }
}

/// Read-only pieces shared by every wave of one invocation.
struct Run<'a> {
    definition: &'a WorkflowDefinition,
    dispatcher: Arc<ExecutorRegistry>,
    event_bus: &'a EventBus,
    execution_id: ExecutionId,
    semaphore: Arc<Semaphore>,
    cancellation: CancellationToken,
}

/// Mutable state threaded through the waves.
struct RunState {
    execution: WorkflowExecution,
    /// Snapshot of inputs and completed outputs; replaced between waves.
    scope: Arc<TemplateScope>,
    /// Steps on a condition branch that was not taken.
    inactive: HashSet<StepId>,
    /// Set under `StopWorkflow` once a required step failed.
    halted: bool,
}

impl Run<'_> {
    async fn waves(&self, plan: &ExecutionPlan, state: &mut RunState) {
        for (index, wave) in plan.waves().iter().enumerate() {
            tracing::debug!(execution_id = %self.execution_id, wave = index, steps = ?wave, "Starting wave");
            self.event_bus.emit(ExecutionEvent::WaveStarted {
                execution_id: self.execution_id,
                wave: index,
                steps: wave.clone(),
                timestamp: Utc::now(),
            });

            let mut tasks = JoinSet::new();
            for step_id in wave {
                let Some(step) = self.definition.find_step(step_id) else {
                    continue;
                };
                self.start_step(step, state, &mut tasks);
            }

            let mut outputs = Vec::new();
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((step_id, result, duration_ms)) => {
                        if let Some(output) = self.settle(&step_id, result, duration_ms, state) {
                            outputs.push((step_id, output));
                        }
                    }
                    Err(e) => tracing::error!("Step task join error: {}", e),
                }
            }

            let scope = Arc::make_mut(&mut state.scope);
            for (step_id, output) in outputs {
                scope.insert_step_output(step_id, output);
            }
        }
    }

    /// Skip, fail on input binding, or spawn one step.
    fn start_step(
        &self,
        step: &StepSpec,
        state: &mut RunState,
        tasks: &mut JoinSet<TaskOutput>,
    ) {
        if let Some(reason) = self.skip_reason(step, state) {
            self.skip(step, reason, &mut state.execution);
            return;
        }

        let inputs = match template::resolve_inputs(&step.inputs, &state.scope) {
            Ok(inputs) => inputs,
            Err(e) => {
                self.fail(step, StepError::from(e), None, state);
                return;
            }
        };

        state
            .execution
            .set_step_status(step.id.clone(), StepStatus::Running);
        self.event_bus.emit(ExecutionEvent::StepStarted {
            execution_id: self.execution_id,
            step_id: step.id.clone(),
            kind: step.kind.name().to_string(),
            timestamp: Utc::now(),
        });

        let dispatcher: Arc<dyn StepDispatcher> = self.dispatcher.clone();
        let ctx = StepContext {
            execution_id: self.execution_id,
            step_id: step.id.clone(),
            kind: step.kind.clone(),
            inputs,
            scope: Arc::clone(&state.scope),
            events: self.event_bus.create_emitter(self.execution_id, &step.id),
            cancellation: self.cancellation.child_token(),
            dispatcher: dispatcher.clone(),
        };
        let semaphore = self.semaphore.clone();
        let step_id = step.id.clone();

        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let start = Instant::now();
            let result = AssertUnwindSafe(dispatcher.dispatch(ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(ExecutorError::ExecutionFailed(
                        "executor panicked".to_string(),
                    ))
                });
            (step_id, result, start.elapsed().as_millis() as u64)
        });
    }

    /// Record a finished step. Returns the output when it should become
    /// visible to later waves.
    fn settle(
        &self,
        step_id: &str,
        result: Result<Value, ExecutorError>,
        duration_ms: u64,
        state: &mut RunState,
    ) -> Option<Value> {
        let step = self.definition.find_step(step_id)?;
        match result {
            Ok(output) => {
                if let StepKind::Condition(config) = &step.kind {
                    let not_taken = match output.get_segment("branch").and_then(Value::as_str) {
                        Some("then") => &config.else_steps,
                        _ => &config.then_steps,
                    };
                    state.inactive.extend(not_taken.iter().cloned());
                }

                tracing::info!("Step {} completed in {}ms", step_id, duration_ms);
                state
                    .execution
                    .record_success(step_id, output.clone(), duration_ms);
                self.event_bus.emit(ExecutionEvent::StepCompleted {
                    execution_id: self.execution_id,
                    step_id: step_id.to_string(),
                    duration_ms,
                    timestamp: Utc::now(),
                });
                Some(output)
            }
            Err(e) => {
                if let StepKind::Condition(config) = &step.kind {
                    state
                        .inactive
                        .extend(config.then_steps.iter().chain(&config.else_steps).cloned());
                }
                self.fail(step, StepError::from(e), Some(duration_ms), state);
                None
            }
        }
    }

    fn skip_reason(&self, step: &StepSpec, state: &RunState) -> Option<String> {
        if state.halted {
            return Some("workflow stopped after an earlier failure".to_string());
        }
        if state.inactive.contains(&step.id) {
            return Some("condition branch not taken".to_string());
        }
        for dep in &step.dependencies {
            match state.execution.step_status(dep) {
                Some(StepStatus::Completed) => {}
                Some(StepStatus::Failed)
                    if self.definition.find_step(dep).is_some_and(|d| d.optional) => {}
                Some(StepStatus::Failed) => return Some(format!("dependency '{}' failed", dep)),
                Some(StepStatus::Skipped) => {
                    return Some(format!("dependency '{}' was skipped", dep))
                }
                _ => return Some(format!("dependency '{}' did not finish", dep)),
            }
        }
        None
    }

    fn skip(&self, step: &StepSpec, reason: String, execution: &mut WorkflowExecution) {
        tracing::debug!("Step {} skipped: {}", step.id, reason);
        execution.set_step_status(step.id.clone(), StepStatus::Skipped);
        self.event_bus.emit(ExecutionEvent::StepSkipped {
            execution_id: self.execution_id,
            step_id: step.id.clone(),
            reason,
            timestamp: Utc::now(),
        });
    }

    fn fail(
        &self,
        step: &StepSpec,
        error: StepError,
        duration_ms: Option<u64>,
        state: &mut RunState,
    ) {
        let message = error.to_string();
        if step.optional {
            tracing::warn!("Optional step {} failed: {}", step.id, message);
        } else {
            tracing::error!("Step {} failed: {}", step.id, message);
            if self.definition.settings.on_error == ErrorHandling::StopWorkflow {
                state.halted = true;
            }
        }

        state
            .execution
            .record_failure(&step.id, error.kind(), message.clone(), duration_ms);
        self.event_bus.emit(ExecutionEvent::StepFailed {
            execution_id: self.execution_id,
            step_id: step.id.clone(),
            error: message,
            timestamp: Utc::now(),
        });
    }

    /// Deadline expired: everything not yet terminal fails with a timeout.
    fn fail_unfinished(&self, execution: &mut WorkflowExecution, ms: u64) {
        for step in &self.definition.steps {
            let finished = execution
                .step_status(&step.id)
                .is_some_and(StepStatus::is_terminal);
            if finished {
                continue;
            }
            let message = ExecutorError::Timeout { ms }.to_string();
            execution.record_failure(&step.id, ErrorKind::Timeout, message.clone(), None);
            self.event_bus.emit(ExecutionEvent::StepFailed {
                execution_id: self.execution_id,
                step_id: step.id.clone(),
                error: message,
                timestamp: Utc::now(),
            });
        }
    }
}

fn emit_completed(event_bus: &EventBus, execution: &WorkflowExecution, started: Instant) {
    event_bus.emit(ExecutionEvent::WorkflowCompleted {
        execution_id: execution.id,
        status: execution.status,
        duration_ms: started.elapsed().as_millis() as u64,
        timestamp: Utc::now(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flowcore::StepExecutor;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Test executor for `transform` steps: `{"fail": msg}` fails, `{"sleep_ms": n}`
    /// waits, anything else echoes the resolved inputs.
    struct Scripted {
        calls: Arc<AtomicUsize>,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Scripted {
        fn new() -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                running: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl StepExecutor for Scripted {
        fn kind(&self) -> &str {
            StepKind::TRANSFORM
        }

        async fn execute(&self, ctx: StepContext) -> Result<Value, ExecutorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            if let Some(ms) = ctx.inputs.get("sleep_ms").and_then(Value::as_f64) {
                tokio::time::sleep(Duration::from_millis(ms as u64)).await;
            }
            self.running.fetch_sub(1, Ordering::SeqCst);

            if let Some(msg) = ctx.input_str("fail") {
                return Err(ExecutorError::ExecutionFailed(msg.to_string()));
            }
            Ok(Value::Object(ctx.inputs))
        }
    }

    /// Condition executor that reads the branch from its `pick` input.
    struct Gate;

    #[async_trait]
    impl StepExecutor for Gate {
        fn kind(&self) -> &str {
            StepKind::CONDITION
        }

        async fn execute(&self, ctx: StepContext) -> Result<Value, ExecutorError> {
            let branch = ctx.input_str("pick").unwrap_or("else").to_string();
            Ok(Value::object([
                ("result", Value::Bool(branch == "then")),
                ("branch", Value::String(branch)),
            ]))
        }
    }

    fn registry(scripted: Scripted) -> Arc<ExecutorRegistry> {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(scripted));
        registry.register(Arc::new(Gate));
        Arc::new(registry)
    }

    fn step(id: &str) -> StepSpec {
        StepSpec::new(id, StepKind::transform("inputs"))
    }

    async fn run(definition: &WorkflowDefinition, inputs: serde_json::Value) -> WorkflowExecution {
        run_with(definition, inputs, registry(Scripted::new())).await
    }

    async fn run_with(
        definition: &WorkflowDefinition,
        inputs: serde_json::Value,
        registry: Arc<ExecutorRegistry>,
    ) -> WorkflowExecution {
        let inputs = match Value::from(inputs) {
            Value::Object(map) => map,
            _ => BTreeMap::new(),
        };
        WorkflowExecutor::new(4)
            .execute(definition, registry, &EventBus::new(64), inputs)
            .await
    }

    #[tokio::test]
    async fn threads_outputs_between_waves() {
        let definition = WorkflowDefinition::new("wf", "chain")
            .with_step(step("a").with_input("v", 10))
            .with_step(step("b").with_input("val", "$a.v").depends_on("a"));

        let execution = run(&definition, json!({})).await;

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.step_results["b"], Value::from(json!({"val": 10})));
        assert!(execution.end_time.is_some());
        assert!(execution.step_durations_ms.contains_key("a"));
    }

    #[tokio::test]
    async fn failed_dependency_skips_dependents_without_dispatch() {
        let scripted = Scripted::new();
        let calls = scripted.calls.clone();
        let definition = WorkflowDefinition::new("wf", "broken")
            .with_step(step("a").with_input("fail", "boom"))
            .with_step(step("b").depends_on("a"))
            .with_step(step("c").depends_on("b"));

        let execution = run_with(&definition, json!({}), registry(scripted)).await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.step_status("b"), Some(StepStatus::Skipped));
        assert_eq!(execution.step_status("c"), Some(StepStatus::Skipped));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(execution.errors.len(), 1);
    }

    #[tokio::test]
    async fn sibling_failure_keeps_partial_results() {
        let definition = WorkflowDefinition::new("wf", "partial")
            .with_step(step("a").with_input("fail", "boom"))
            .with_step(step("b").with_input("ok", true))
            .with_step(step("c").with_input("from_b", "$b.ok").depends_on("b"));

        let execution = run(&definition, json!({})).await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(!execution.step_results.contains_key("a"));
        assert!(execution.step_results.contains_key("b"));
        assert_eq!(execution.step_status("c"), Some(StepStatus::Completed));
        assert_eq!(execution.errors.len(), 1);
        assert_eq!(execution.errors[0].step_id.as_deref(), Some("a"));
        assert_eq!(execution.errors[0].kind, ErrorKind::Executor);
    }

    #[tokio::test]
    async fn missing_input_is_a_step_local_template_error() {
        let definition = WorkflowDefinition::new("wf", "missing")
            .with_step(step("needs").with_input("x", "$input.missingField"))
            .with_step(step("sibling").with_input("y", "$input.present"));

        let execution = run(&definition, json!({"present": 1})).await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.step_status("needs"), Some(StepStatus::Failed));
        assert_eq!(execution.step_status("sibling"), Some(StepStatus::Completed));
        assert_eq!(execution.errors[0].kind, ErrorKind::Template);
        assert!(execution.errors[0].message.contains("missingField"));
    }

    #[tokio::test]
    async fn cycle_fails_before_any_step() {
        let scripted = Scripted::new();
        let calls = scripted.calls.clone();
        let definition = WorkflowDefinition::new("wf", "cycle")
            .with_step(step("a").depends_on("b"))
            .with_step(step("b").depends_on("a"));

        let execution = run_with(&definition, json!({}), registry(scripted)).await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.errors.len(), 1);
        assert_eq!(execution.errors[0].kind, ErrorKind::Graph);
        assert!(execution.errors[0].step_id.is_none());
        assert_eq!(execution.count_steps(StepStatus::Completed), 0);
        assert!(execution.step_statuses.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unregistered_kind_is_a_configuration_error() {
        let definition = WorkflowDefinition::new("wf", "unknown")
            .with_step(StepSpec::new("call", StepKind::external_call("GET", "http://x")));

        let execution = run(&definition, json!({})).await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.errors.len(), 1);
        assert_eq!(execution.errors[0].kind, ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn optional_failure_is_tolerated() {
        let definition = WorkflowDefinition::new("wf", "tolerant")
            .with_step(step("extra").with_input("fail", "meh").optional())
            .with_step(step("next").with_input("n", 1).depends_on("extra"));

        let execution = run(&definition, json!({})).await;

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.step_status("extra"), Some(StepStatus::Failed));
        assert_eq!(execution.step_status("next"), Some(StepStatus::Completed));
        assert_eq!(execution.errors.len(), 1);
    }

    #[tokio::test]
    async fn condition_skips_branch_not_taken() {
        let definition = WorkflowDefinition::new("wf", "branch")
            .with_step(
                StepSpec::new("gate", StepKind::condition("x", ["yes"], ["no"]))
                    .with_input("pick", "$input.pick"),
            )
            .with_step(step("yes").depends_on("gate"))
            .with_step(step("no").depends_on("gate"))
            .with_step(step("after_no").depends_on("no"));

        let execution = run(&definition, json!({"pick": "then"})).await;

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.step_status("yes"), Some(StepStatus::Completed));
        assert_eq!(execution.step_status("no"), Some(StepStatus::Skipped));
        assert_eq!(execution.step_status("after_no"), Some(StepStatus::Skipped));
        assert!(execution.errors.is_empty());
    }

    #[tokio::test]
    async fn stop_workflow_skips_later_waves() {
        let definition = WorkflowDefinition::new("wf", "strict")
            .with_settings(flowcore::WorkflowSettings {
                on_error: ErrorHandling::StopWorkflow,
                ..Default::default()
            })
            .with_step(step("a").with_input("fail", "boom"))
            .with_step(step("b").with_input("ok", 1))
            .with_step(step("c").depends_on("b"));

        let execution = run(&definition, json!({})).await;

        assert_eq!(execution.step_status("b"), Some(StepStatus::Completed));
        assert_eq!(execution.step_status("c"), Some(StepStatus::Skipped));
        assert_eq!(execution.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn deadline_fails_unfinished_steps() {
        let definition = WorkflowDefinition::new("wf", "slow")
            .with_settings(flowcore::WorkflowSettings {
                timeout_ms: Some(50),
                ..Default::default()
            })
            .with_step(step("fast").with_input("ok", 1))
            .with_step(step("slow").with_input("sleep_ms", 5_000))
            .with_step(step("later").depends_on("slow"));

        let execution = run(&definition, json!({})).await;

        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.step_status("fast"), Some(StepStatus::Completed));
        assert_eq!(execution.step_status("slow"), Some(StepStatus::Failed));
        assert_eq!(execution.step_status("later"), Some(StepStatus::Failed));
        assert!(execution
            .errors
            .iter()
            .all(|e| e.kind == ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn wave_concurrency_is_bounded() {
        let scripted = Scripted::new();
        let peak = scripted.peak.clone();
        let mut definition = WorkflowDefinition::new("wf", "wide").with_settings(
            flowcore::WorkflowSettings {
                max_parallel_steps: Some(2),
                ..Default::default()
            },
        );
        for i in 0..6 {
            definition.add_step(step(&format!("s{}", i)).with_input("sleep_ms", 20));
        }

        let execution = run_with(&definition, json!({}), registry(scripted)).await;

        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
