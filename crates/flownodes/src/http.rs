use async_trait::async_trait;
use flowcore::{
    ExecutorError, ExternalCallConfig, StepContext, StepExecutor, StepKind, StepSpec, Value,
};
use reqwest::Method;
use std::collections::BTreeMap;
use std::time::Duration;

/// `external_call`: one outbound HTTP request per step, with optional retry
/// on transport errors and 5xx responses.
pub struct ExternalCallExecutor {
    client: reqwest::Client,
}

impl ExternalCallExecutor {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ExternalCallExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// A request with every template already resolved.
struct PreparedRequest {
    method: Method,
    url: String,
    headers: Vec<(String, String)>,
    query: Vec<(String, String)>,
    body: Option<Value>,
    timeout: Option<Duration>,
}

enum Attempt {
    Done(Value),
    Retryable(ExecutorError),
    Fatal(ExecutorError),
}

#[async_trait]
impl StepExecutor for ExternalCallExecutor {
    fn kind(&self) -> &str {
        StepKind::EXTERNAL_CALL
    }

    fn description(&self) -> &str {
        "Make an HTTP request"
    }

    fn validate(&self, step: &StepSpec) -> Result<(), ExecutorError> {
        let config = config_of(&step.kind)?;
        if config.url.trim().is_empty() {
            return Err(ExecutorError::Configuration("url is required".to_string()));
        }
        parse_method(&config.method)?;
        Ok(())
    }

    async fn execute(&self, ctx: StepContext) -> Result<Value, ExecutorError> {
        let config = config_of(&ctx.kind)?;
        let request = prepare(config, &ctx)?;
        let policy = config.retry.clone().unwrap_or_default();
        let attempts = config.retry.as_ref().map_or(1, |p| p.max_attempts.max(1));

        ctx.events
            .info(format!("{} {}", request.method, request.url));

        let mut attempt = 1;
        loop {
            let error = match self.send(&request).await {
                Attempt::Done(output) => return Ok(output),
                Attempt::Fatal(e) => return Err(e),
                Attempt::Retryable(e) => e,
            };

            if attempt >= attempts {
                return Err(error);
            }

            let delay = policy.delay_for(attempt);
            tracing::warn!(
                step_id = %ctx.step_id,
                "Attempt {}/{} failed ({}), retrying in {:?}",
                attempt,
                attempts,
                error,
                delay
            );
            ctx.events
                .warn(format!("attempt {} failed: {}", attempt, error));

            tokio::select! {
                _ = ctx.cancellation.cancelled() => return Err(ExecutorError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

impl ExternalCallExecutor {
    async fn send(&self, request: &PreparedRequest) -> Attempt {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .query(&request.query);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        builder = match &request.body {
            Some(Value::String(text)) => builder.body(text.clone()),
            Some(body) => builder.json(&serde_json::Value::from(body.clone())),
            None => builder,
        };
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => return Attempt::Retryable(ExecutorError::Request(e.to_string())),
        };

        let status = response.status();
        let headers: BTreeMap<String, Value> = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.to_string(),
                    Value::String(v.to_str().unwrap_or("").to_string()),
                )
            })
            .collect();

        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                return Attempt::Retryable(ExecutorError::Request(format!(
                    "failed to read response: {}",
                    e
                )))
            }
        };

        if !status.is_success() {
            let error = ExecutorError::HttpStatus {
                status: status.as_u16(),
                body: text,
            };
            return if status.is_server_error() {
                Attempt::Retryable(error)
            } else {
                Attempt::Fatal(error)
            };
        }

        let body = serde_json::from_str::<serde_json::Value>(&text)
            .map(Value::from)
            .unwrap_or(Value::String(text));

        Attempt::Done(Value::object([
            ("status", Value::from(status.as_u16() as u64)),
            ("headers", Value::Object(headers)),
            ("body", body),
        ]))
    }
}

fn config_of(kind: &StepKind) -> Result<&ExternalCallConfig, ExecutorError> {
    match kind {
        StepKind::ExternalCall(config) => Ok(config),
        other => Err(ExecutorError::Configuration(format!(
            "expected external_call config, got {}",
            other.name()
        ))),
    }
}

fn parse_method(method: &str) -> Result<Method, ExecutorError> {
    Method::from_bytes(method.trim().to_uppercase().as_bytes())
        .map_err(|_| ExecutorError::Configuration(format!("Unsupported method: {}", method)))
}

/// Resolve the templates embedded in the config. A config without `body`
/// falls back to the resolved `body` input.
fn prepare(config: &ExternalCallConfig, ctx: &StepContext) -> Result<PreparedRequest, ExecutorError> {
    let headers = config
        .headers
        .iter()
        .map(|(name, value)| Ok((name.clone(), ctx.render(value)?)))
        .collect::<Result<Vec<_>, ExecutorError>>()?;

    let mut query = Vec::new();
    for (name, value) in &config.query {
        match ctx.resolve(value)? {
            Value::Null => {}
            resolved => query.push((name.clone(), resolved.to_display_string())),
        }
    }

    let body = match &config.body {
        Some(body) => Some(ctx.resolve(body)?),
        None => ctx.inputs.get("body").cloned(),
    };

    Ok(PreparedRequest {
        method: parse_method(&config.method)?,
        url: ctx.render(&config.url)?,
        headers,
        query,
        body,
        timeout: config.timeout_ms.map(Duration::from_millis),
    })
}
