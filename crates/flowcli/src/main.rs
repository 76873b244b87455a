// crates/flowcli/src/main.rs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flowcore::{
    ExecutionEvent, ExecutionStatus, StepEvent, StepKind, StepSpec, Value, WorkflowDefinition,
    WorkflowExecution, WorkflowSettings,
};
use flowruntime::{ExecutorRegistry, FlowRuntime, RuntimeConfig};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "flow")]
#[command(about = "Flow Engine CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file
    Run {
        /// Path to workflow JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Input data as JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// Overall deadline in milliseconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Validate a workflow file (graph and step kinds)
    Validate {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// Print the execution waves of a workflow file
    Plan {
        /// Path to workflow JSON file
        file: PathBuf,
    },

    /// List available step kinds
    Kinds,

    /// Create a new example workflow
    Init {
        /// Output file path
        #[arg(short, long, default_value = "workflow.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            input,
            timeout,
            verbose,
        } => {
            init_logging(verbose);
            let execution = run_workflow(file, input, timeout).await?;
            if execution.status == ExecutionStatus::Failed {
                std::process::exit(1);
            }
        }

        Commands::Validate { file } => {
            init_logging(false);
            validate_workflow(file)?;
        }

        Commands::Plan { file } => {
            init_logging(false);
            plan_workflow(file)?;
        }

        Commands::Kinds => {
            list_kinds();
        }

        Commands::Init { output } => {
            create_example_workflow(output)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .init();
}

fn runtime() -> FlowRuntime {
    let mut registry = ExecutorRegistry::new();
    flownodes::register_all(&mut registry);
    FlowRuntime::with_registry(registry, RuntimeConfig::from_env())
}

fn load_workflow(file: &Path) -> Result<WorkflowDefinition> {
    let workflow_json = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let workflow: WorkflowDefinition = serde_json::from_str(&workflow_json)
        .with_context(|| format!("parsing {}", file.display()))?;
    debug!(workflow_id = %workflow.id, steps = workflow.steps.len(), "loaded workflow");
    Ok(workflow)
}

fn parse_inputs(input: Option<String>) -> Result<BTreeMap<String, Value>> {
    let Some(input_str) = input else {
        return Ok(BTreeMap::new());
    };
    match Value::from(serde_json::from_str::<serde_json::Value>(&input_str)?) {
        Value::Object(map) => Ok(map),
        _ => Err(anyhow::anyhow!("Input must be a JSON object")),
    }
}

async fn run_workflow(
    file: PathBuf,
    input: Option<String>,
    timeout: Option<u64>,
) -> Result<WorkflowExecution> {
    println!("🚀 Loading workflow from: {}", file.display());

    let mut workflow = load_workflow(&file)?;
    if timeout.is_some() {
        workflow.settings.timeout_ms = timeout;
    }

    println!("📋 Workflow: {} (v{})", workflow.name, workflow.version);
    println!("   Steps: {}", workflow.steps.len());
    println!();

    let inputs = parse_inputs(input)?;
    let runtime = runtime();

    // Subscribe to events for real-time output
    let mut events = runtime.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(event);
        }
    });

    let execution = runtime.execute(&workflow, inputs).await;

    // Wait for events to finish printing
    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    event_task.abort();

    println!();
    println!("📊 Execution Summary:");
    println!("   Execution ID: {}", execution.id);
    println!("   Status: {}", execution.status);
    for (step_id, status) in &execution.step_statuses {
        println!("   {:<20} {}", step_id, status);
    }

    if !execution.errors.is_empty() {
        println!();
        println!("❗ Errors:");
        for error in &execution.errors {
            let step = error.step_id.as_deref().unwrap_or("-");
            println!("   [{}] {}", step, error.message);
        }
    }

    if !execution.step_results.is_empty() {
        println!();
        println!("📤 Outputs:");
        println!("{}", serde_json::to_string_pretty(&execution.step_results)?);
    }

    Ok(execution.as_ref().clone())
}

fn print_event(event: ExecutionEvent) {
    match event {
        ExecutionEvent::WorkflowStarted { .. } => {
            println!("▶️  Workflow started");
        }
        ExecutionEvent::WaveStarted { wave, steps, .. } => {
            println!("  🌊 Wave {}: {}", wave, steps.join(", "));
        }
        ExecutionEvent::StepStarted { step_id, kind, .. } => {
            println!("  ⚡ Starting step: {} ({})", step_id, kind);
        }
        ExecutionEvent::StepCompleted {
            step_id,
            duration_ms,
            ..
        } => {
            println!("  ✅ Step {} completed in {}ms", step_id, duration_ms);
        }
        ExecutionEvent::StepFailed { step_id, error, .. } => {
            println!("  ❌ Step {} failed: {}", step_id, error);
        }
        ExecutionEvent::StepSkipped {
            step_id, reason, ..
        } => {
            println!("  ⏭️  Step {} skipped: {}", step_id, reason);
        }
        ExecutionEvent::StepEvent { step_id, event, .. } => match event {
            StepEvent::Info { message } => {
                println!("     ℹ️  [{}] {}", step_id, message);
            }
            StepEvent::Warning { message } => {
                println!("     ⚠️  [{}] {}", step_id, message);
            }
            StepEvent::Progress { percent, message } => {
                if let Some(msg) = message {
                    println!("     📊 [{}] {:.0}% - {}", step_id, percent, msg);
                } else {
                    println!("     📊 [{}] {:.0}%", step_id, percent);
                }
            }
        },
        ExecutionEvent::WorkflowCompleted {
            status,
            duration_ms,
            ..
        } => {
            if status == ExecutionStatus::Completed {
                println!("✨ Workflow completed successfully in {}ms", duration_ms);
            } else {
                println!("💥 Workflow failed after {}ms", duration_ms);
            }
        }
    }
}

fn validate_workflow(file: PathBuf) -> Result<()> {
    println!("🔍 Validating workflow: {}", file.display());

    let workflow = load_workflow(&file)?;
    let plan = runtime().validate(&workflow)?;

    println!("✅ Workflow is valid:");
    println!("   Name: {}", workflow.name);
    println!("   Steps: {}", workflow.steps.len());
    println!("   Waves: {}", plan.waves().len());

    Ok(())
}

fn plan_workflow(file: PathBuf) -> Result<()> {
    let workflow = load_workflow(&file)?;
    let plan = flowruntime::plan_waves(&workflow.steps)?;

    println!("🗺️  Execution plan for {}:", workflow.name);
    for (index, wave) in plan.waves().iter().enumerate() {
        let steps: Vec<String> = wave
            .iter()
            .map(|id| match workflow.find_step(id) {
                Some(step) => format!("{} ({})", id, step.kind.name()),
                None => id.clone(),
            })
            .collect();
        println!("   {}: {}", index, steps.join(", "));
    }

    Ok(())
}

fn list_kinds() {
    println!("📦 Available Step Kinds:");
    println!();

    let mut registry = ExecutorRegistry::new();
    flownodes::register_all(&mut registry);

    for kind in registry.list_kinds() {
        match registry.get_metadata(&kind) {
            Some(metadata) if !metadata.description.is_empty() => {
                println!("  • {}", kind);
                println!("    {}", metadata.description);
            }
            _ => println!("  • {}", kind),
        }
    }
}

fn create_example_workflow(output: PathBuf) -> Result<()> {
    let workflow = WorkflowDefinition::new("example-report", "Example Report Workflow")
        .with_description("Fetches a JSON document and summarizes its size")
        .with_settings(WorkflowSettings {
            timeout_ms: Some(30_000),
            ..WorkflowSettings::default()
        })
        .with_step(
            StepSpec::new("fetch", StepKind::external_call("GET", "$input.url"))
                .with_name("Fetch Data"),
        )
        .with_step(
            StepSpec::new(
                "measure",
                StepKind::transform("return {keys: len(keys(body)), status: status}"),
            )
            .with_name("Measure Response")
            .with_input("body", "$fetch.body")
            .with_input("status", "$fetch.status")
            .depends_on("fetch"),
        );

    let json = serde_json::to_string_pretty(&workflow)?;
    std::fs::write(&output, json)?;

    println!("✨ Created example workflow: {}", output.display());
    println!();
    println!("Run it with:");
    println!(
        "  flow run --file {} --input '{{\"url\": \"https://api.github.com\"}}'",
        output.display()
    );

    Ok(())
}
