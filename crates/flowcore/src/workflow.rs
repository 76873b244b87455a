use crate::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub type WorkflowId = String;
pub type StepId = String;

/// Complete workflow definition. Read-only input to the engine for the
/// duration of one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub triggers: Vec<TriggerSpec>,
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub settings: WorkflowSettings,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: default_version(),
            description: None,
            triggers: vec![TriggerSpec::manual()],
            steps: Vec::new(),
            settings: WorkflowSettings::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_settings(mut self, settings: WorkflowSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn add_step(&mut self, step: StepSpec) -> StepId {
        let id = step.id.clone();
        self.steps.push(step);
        id
    }

    pub fn find_step(&self, id: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// One step of a workflow.
///
/// On the wire the step kind is split into a `kind` name and a kind-specific
/// `config` object; in memory it is the closed [`StepKind`] sum type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawStep", into = "RawStep")]
pub struct StepSpec {
    pub id: StepId,
    pub kind: StepKind,
    pub name: Option<String>,
    /// Logical parameter name -> template string or literal.
    pub inputs: BTreeMap<String, Value>,
    /// Output fields the step is expected to produce. Documentation only.
    pub outputs: Vec<String>,
    pub dependencies: Vec<StepId>,
    /// A failed optional step is recorded but tolerated: dependents still run
    /// and the execution can still complete.
    pub optional: bool,
}

impl StepSpec {
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            kind,
            name: None,
            inputs: BTreeMap::new(),
            outputs: Vec::new(),
            dependencies: Vec::new(),
            optional: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(key.into(), value.into());
        self
    }

    pub fn with_outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.dependencies.push(step_id.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawStep {
    id: StepId,
    kind: String,
    #[serde(default)]
    config: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default)]
    inputs: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    outputs: Vec<String>,
    #[serde(default)]
    dependencies: Vec<StepId>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    optional: bool,
}

impl TryFrom<RawStep> for StepSpec {
    type Error = String;

    fn try_from(raw: RawStep) -> Result<Self, Self::Error> {
        let kind = StepKind::from_parts(&raw.kind, raw.config)
            .map_err(|e| format!("step '{}': {}", raw.id, e))?;
        Ok(Self {
            id: raw.id,
            kind,
            name: raw.name,
            inputs: raw.inputs,
            outputs: raw.outputs,
            dependencies: raw.dependencies,
            optional: raw.optional,
        })
    }
}

impl From<StepSpec> for RawStep {
    fn from(step: StepSpec) -> Self {
        Self {
            id: step.id,
            kind: step.kind.name().to_string(),
            config: step.kind.config_json(),
            name: step.name,
            inputs: step.inputs,
            outputs: step.outputs,
            dependencies: step.dependencies,
            optional: step.optional,
        }
    }
}

/// Closed set of step kinds, each carrying its own config shape.
#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    ExternalCall(ExternalCallConfig),
    GenerativeText(GenerativeTextConfig),
    Transform(TransformConfig),
    Parallel(ParallelConfig),
    Condition(ConditionConfig),
}

impl StepKind {
    pub const EXTERNAL_CALL: &'static str = "external_call";
    pub const GENERATIVE_TEXT: &'static str = "generative_text";
    pub const TRANSFORM: &'static str = "transform";
    pub const PARALLEL: &'static str = "parallel";
    pub const CONDITION: &'static str = "condition";

    pub const ALL: [&'static str; 5] = [
        Self::EXTERNAL_CALL,
        Self::GENERATIVE_TEXT,
        Self::TRANSFORM,
        Self::PARALLEL,
        Self::CONDITION,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StepKind::ExternalCall(_) => Self::EXTERNAL_CALL,
            StepKind::GenerativeText(_) => Self::GENERATIVE_TEXT,
            StepKind::Transform(_) => Self::TRANSFORM,
            StepKind::Parallel(_) => Self::PARALLEL,
            StepKind::Condition(_) => Self::CONDITION,
        }
    }

    pub fn transform(expr: impl Into<String>) -> Self {
        StepKind::Transform(TransformConfig { expr: expr.into() })
    }

    pub fn condition<T, E>(expr: impl Into<String>, then_steps: T, else_steps: E) -> Self
    where
        T: IntoIterator,
        T::Item: Into<String>,
        E: IntoIterator,
        E::Item: Into<String>,
    {
        StepKind::Condition(ConditionConfig {
            expr: expr.into(),
            then_steps: then_steps.into_iter().map(Into::into).collect(),
            else_steps: else_steps.into_iter().map(Into::into).collect(),
        })
    }

    pub fn external_call(method: impl Into<String>, url: impl Into<String>) -> Self {
        StepKind::ExternalCall(ExternalCallConfig {
            method: method.into(),
            url: url.into(),
            ..ExternalCallConfig::default()
        })
    }

    pub fn generative_text(prompt: impl Into<String>) -> Self {
        StepKind::GenerativeText(GenerativeTextConfig {
            prompt: Some(prompt.into()),
            ..GenerativeTextConfig::default()
        })
    }

    pub fn parallel(branches: Vec<StepSpec>) -> Self {
        StepKind::Parallel(ParallelConfig {
            branches,
            max_concurrency: None,
        })
    }

    /// Build a kind from its wire name and config object.
    pub fn from_parts(kind: &str, config: serde_json::Value) -> Result<Self, String> {
        let config = if config.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            config
        };
        let parsed = match kind {
            Self::EXTERNAL_CALL => serde_json::from_value(config).map(StepKind::ExternalCall),
            Self::GENERATIVE_TEXT => serde_json::from_value(config).map(StepKind::GenerativeText),
            Self::TRANSFORM => serde_json::from_value(config).map(StepKind::Transform),
            Self::PARALLEL => serde_json::from_value(config).map(StepKind::Parallel),
            Self::CONDITION => serde_json::from_value(config).map(StepKind::Condition),
            other => return Err(format!("unknown step kind '{}'", other)),
        };
        parsed.map_err(|e| format!("invalid {} config: {}", kind, e))
    }

    pub fn config_json(&self) -> serde_json::Value {
        let encoded = match self {
            StepKind::ExternalCall(c) => serde_json::to_value(c),
            StepKind::GenerativeText(c) => serde_json::to_value(c),
            StepKind::Transform(c) => serde_json::to_value(c),
            StepKind::Parallel(c) => serde_json::to_value(c),
            StepKind::Condition(c) => serde_json::to_value(c),
        };
        encoded.unwrap_or(serde_json::Value::Null)
    }
}

/// Single outbound HTTP call. String fields and `body` may contain templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalCallConfig {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub query: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl Default for ExternalCallConfig {
    fn default() -> Self {
        Self {
            method: default_method(),
            url: String::new(),
            headers: BTreeMap::new(),
            query: BTreeMap::new(),
            body: None,
            timeout_ms: None,
            retry: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerativeTextConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub response_format: ResponseFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformConfig {
    #[serde(alias = "expression")]
    pub expr: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelConfig {
    /// Sub-steps run concurrently. Their `dependencies` must be empty.
    pub branches: Vec<StepSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionConfig {
    #[serde(alias = "expression")]
    pub expr: String,
    #[serde(default, rename = "then")]
    pub then_steps: Vec<StepId>,
    #[serde(default, rename = "else")]
    pub else_steps: Vec<StepId>,
}

/// Retry policy for executors that opt into retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
    #[serde(default = "default_backoff")]
    pub backoff_multiplier: f64,
}

fn default_backoff() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> std::time::Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        std::time::Duration::from_millis((self.delay_ms as f64 * factor) as u64)
    }
}

/// Workflow trigger descriptor. Opaque to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSpec {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub trigger_type: TriggerType,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl TriggerSpec {
    pub fn manual() -> Self {
        Self {
            id: Uuid::new_v4(),
            trigger_type: TriggerType::Manual,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Webhook { path: String },
    External { source: String },
}

/// Per-workflow execution settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSettings {
    /// Overall deadline for one invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Caps concurrent steps per wave below the runtime-wide limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel_steps: Option<usize>,
    #[serde(default)]
    pub on_error: ErrorHandling,
}

/// What happens to the rest of a run after a required step fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorHandling {
    /// Keep running every step that does not depend on the failure.
    #[default]
    ContinueIndependent,
    /// Let the current wave settle, then skip everything after it.
    StopWorkflow,
}
