use async_trait::async_trait;
use flowcore::{
    ExecutorError, GenerativeTextConfig, ResponseFormat, StepContext, StepExecutor, StepKind,
    StepSpec, Value,
};
use serde_json::json;
use std::sync::Arc;

/// One completion request, fully resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub system: Option<String>,
    pub prompt: String,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub json: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResponse {
    pub text: String,
    pub model: String,
}

/// Text-generation backend behind `generative_text` steps.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: GenerationRequest)
        -> Result<GenerationResponse, ExecutorError>;
}

/// Connection settings for an OpenAI-compatible chat completions API.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
        }
    }
}

impl GenerationConfig {
    /// Read `FLOW_LLM_BASE_URL`, `FLOW_LLM_API_KEY` and `FLOW_LLM_MODEL`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("FLOW_LLM_BASE_URL").unwrap_or(defaults.base_url),
            api_key: std::env::var("FLOW_LLM_API_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            model: std::env::var("FLOW_LLM_MODEL").unwrap_or(defaults.model),
        }
    }
}

/// Default backend: POST `{base_url}/chat/completions` with a bearer key.
pub struct OpenAiCompatibleGenerator {
    client: reqwest::Client,
    config: GenerationConfig,
}

impl OpenAiCompatibleGenerator {
    pub fn new(config: GenerationConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub fn from_env() -> Self {
        Self::new(GenerationConfig::from_env())
    }
}

#[async_trait]
impl TextGenerator for OpenAiCompatibleGenerator {
    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResponse, ExecutorError> {
        let model = request
            .model
            .unwrap_or_else(|| self.config.model.clone());

        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let mut body = json!({
            "model": model,
            "messages": messages,
        });
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if request.json {
            body["response_format"] = json!({"type": "json_object"});
        }

        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let mut http = self.client.post(&url).json(&body);
        if let Some(key) = &self.config.api_key {
            http = http.bearer_auth(key);
        }

        let response = http
            .send()
            .await
            .map_err(|e| ExecutorError::Request(format!("generation request failed: {}", e)))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ExecutorError::Request(format!("failed to read response: {}", e)))?;
        if !status.is_success() {
            return Err(ExecutorError::HttpStatus {
                status: status.as_u16(),
                body: text,
            });
        }

        let parsed: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| ExecutorError::MalformedOutput(format!("invalid response JSON: {}", e)))?;
        let content = parsed["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let model = parsed["model"].as_str().unwrap_or(&model).to_string();

        Ok(GenerationResponse {
            text: content,
            model,
        })
    }
}

/// `generative_text`: build a prompt from the step config, call the
/// generator and reject empty or unparseable output.
pub struct GenerativeTextExecutor {
    generator: Arc<dyn TextGenerator>,
}

impl GenerativeTextExecutor {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl StepExecutor for GenerativeTextExecutor {
    fn kind(&self) -> &str {
        StepKind::GENERATIVE_TEXT
    }

    fn description(&self) -> &str {
        "Generate text with a language model"
    }

    fn validate(&self, step: &StepSpec) -> Result<(), ExecutorError> {
        let config = config_of(&step.kind)?;
        if config.prompt.is_none() && !step.inputs.contains_key("prompt") {
            return Err(ExecutorError::Configuration(
                "a prompt is required in config or inputs".to_string(),
            ));
        }
        Ok(())
    }

    async fn execute(&self, ctx: StepContext) -> Result<Value, ExecutorError> {
        let config = config_of(&ctx.kind)?;
        let prompt = match &config.prompt {
            Some(template) => ctx.render(template)?,
            None => ctx.require_input("prompt")?.to_display_string(),
        };
        let system = config
            .system
            .as_deref()
            .map(|s| ctx.render(s))
            .transpose()?;
        let json_output = config.response_format == ResponseFormat::Json;

        ctx.events.info(format!("generating ({} prompt chars)", prompt.len()));

        let response = self
            .generator
            .generate(GenerationRequest {
                system,
                prompt,
                model: config.model.clone(),
                temperature: config.temperature,
                max_tokens: config.max_tokens,
                json: json_output,
            })
            .await?;

        let text = response.text.trim();
        if text.is_empty() {
            return Err(ExecutorError::MalformedOutput(
                "model returned empty text".to_string(),
            ));
        }

        let mut output = Value::object([
            ("text", Value::from(text)),
            ("model", Value::from(response.model)),
        ]);
        if json_output {
            let data: serde_json::Value = serde_json::from_str(strip_fences(text))
                .map_err(|e| ExecutorError::MalformedOutput(format!("expected JSON: {}", e)))?;
            if let Value::Object(map) = &mut output {
                map.insert("data".to_string(), Value::from(data));
            }
        }
        Ok(output)
    }
}

fn config_of(kind: &StepKind) -> Result<&GenerativeTextConfig, ExecutorError> {
    match kind {
        StepKind::GenerativeText(config) => Ok(config),
        other => Err(ExecutorError::Configuration(format!(
            "expected generative_text config, got {}",
            other.name()
        ))),
    }
}

/// Models often wrap JSON in a ```json fence.
fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_code_fences() {
        assert_eq!(strip_fences("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(strip_fences("  {\"a\": 1} "), "{\"a\": 1}");
    }

    #[test]
    fn prompt_is_required_somewhere() {
        let executor = GenerativeTextExecutor::new(Arc::new(OpenAiCompatibleGenerator::new(
            GenerationConfig::default(),
        )));
        let mut step = StepSpec::new(
            "g",
            StepKind::GenerativeText(GenerativeTextConfig::default()),
        );
        assert!(executor.validate(&step).is_err());

        step = step.with_input("prompt", "$input.question");
        assert!(executor.validate(&step).is_ok());
    }
}
