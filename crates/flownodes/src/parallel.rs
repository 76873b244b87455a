use async_trait::async_trait;
use flowcore::{
    ExecutorError, ParallelConfig, StepContext, StepDispatcher, StepExecutor, StepKind, StepSpec,
    Value,
};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Output key listing failed branches.
pub const ERRORS_KEY: &str = "errors";

/// `parallel`: run nested branch steps concurrently and merge their outputs
/// by branch id.
///
/// A failing branch does not cancel its siblings. The step itself fails
/// only when every branch failed. Branches that do work hold one of the
/// dispatcher's engine-wide branch permits, so nesting `parallel` steps does
/// not multiply concurrency.
pub struct ParallelExecutor;

#[async_trait]
impl StepExecutor for ParallelExecutor {
    fn kind(&self) -> &str {
        StepKind::PARALLEL
    }

    fn description(&self) -> &str {
        "Fan out to concurrent branches"
    }

    fn validate(&self, step: &StepSpec) -> Result<(), ExecutorError> {
        let config = config_of(&step.kind)?;
        let mut seen = HashSet::new();
        for branch in &config.branches {
            if branch.id == ERRORS_KEY {
                return Err(ExecutorError::Configuration(format!(
                    "branch id '{}' is reserved",
                    ERRORS_KEY
                )));
            }
            if !seen.insert(branch.id.as_str()) {
                return Err(ExecutorError::Configuration(format!(
                    "duplicate branch id '{}'",
                    branch.id
                )));
            }
            if !branch.dependencies.is_empty() {
                return Err(ExecutorError::Configuration(format!(
                    "branch '{}' cannot declare dependencies",
                    branch.id
                )));
            }
        }
        Ok(())
    }

    async fn execute(&self, ctx: StepContext) -> Result<Value, ExecutorError> {
        let config = config_of(&ctx.kind)?;
        let total = config.branches.len();
        if total == 0 {
            return Ok(Value::Object(BTreeMap::new()));
        }

        let limit = config
            .max_concurrency
            .map_or(ctx.dispatcher.parallel_limit(), |n| {
                n.min(ctx.dispatcher.parallel_limit())
            })
            .max(1);
        ctx.events
            .info(format!("running {} branches, at most {} at once", total, limit));

        // Futures own everything they touch so the stream stays `Send`.
        let branches: Vec<_> = config
            .branches
            .iter()
            .map(|branch| {
                let id = branch.id.clone();
                let child = ctx.nested(branch);
                let dispatcher = Arc::clone(&ctx.dispatcher);
                // Nested `parallel` branches only coordinate; their leaves take permits.
                let permits = (!matches!(branch.kind, StepKind::Parallel(_)))
                    .then(|| dispatcher.branch_permits());
                async move {
                    let result = match child {
                        Ok(child) => run_branch(dispatcher, permits, child).await,
                        Err(e) => Err(e),
                    };
                    (id, result)
                }
            })
            .collect();

        let events = ctx.events.clone();
        let mut finished = 0usize;
        let results: Vec<(String, Result<Value, ExecutorError>)> = stream::iter(branches)
            .buffer_unordered(limit)
            .inspect(move |_| {
                finished += 1;
                events.progress(
                    finished as f64 / total as f64 * 100.0,
                    Some(format!("{}/{} branches done", finished, total)),
                );
            })
            .collect()
            .await;

        let mut output = BTreeMap::new();
        let mut errors = BTreeMap::new();
        for (id, result) in results {
            match result {
                Ok(value) => {
                    output.insert(id, value);
                }
                Err(e) => {
                    tracing::warn!(step_id = %ctx.step_id, "Branch {} failed: {}", id, e);
                    errors.insert(id.clone(), Value::String(e.to_string()));
                    output.insert(id, Value::Null);
                }
            }
        }

        if errors.len() == total {
            let summary = errors
                .iter()
                .map(|(id, e)| format!("{}: {}", id, e.to_display_string()))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ExecutorError::ExecutionFailed(format!(
                "all {} branches failed ({})",
                total, summary
            )));
        }
        if !errors.is_empty() {
            output.insert(ERRORS_KEY.to_string(), Value::Object(errors));
        }
        Ok(Value::Object(output))
    }
}

async fn run_branch(
    dispatcher: Arc<dyn StepDispatcher>,
    permits: Option<Arc<Semaphore>>,
    child: StepContext,
) -> Result<Value, ExecutorError> {
    let _permit = match permits {
        Some(permits) => tokio::select! {
            permit = permits.acquire_owned() => Some(permit.map_err(|_| {
                ExecutorError::ExecutionFailed("branch permits closed".to_string())
            })?),
            _ = child.cancellation.cancelled() => return Err(ExecutorError::Cancelled),
        },
        None => None,
    };
    dispatcher.dispatch(child).await
}

fn config_of(kind: &StepKind) -> Result<&ParallelConfig, ExecutorError> {
    match kind {
        StepKind::Parallel(config) => Ok(config),
        other => Err(ExecutorError::Configuration(format!(
            "expected parallel config, got {}",
            other.name()
        ))),
    }
}
