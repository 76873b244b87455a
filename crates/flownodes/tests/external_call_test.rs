mod common;

use common::{context, registry, serve, StubGenerator};
use flowcore::{
    ExecutorError, ExternalCallConfig, RetryPolicy, StepExecutor, StepKind, StepSpec,
    TemplateScope, Value,
};
use flownodes::ExternalCallExecutor;
use serde_json::json;
use std::collections::BTreeMap;

fn call(config: ExternalCallConfig) -> StepKind {
    StepKind::ExternalCall(config)
}

#[tokio::test]
async fn resolves_templates_and_parses_json_body() {
    let server = serve(vec![(200, r#"{"items":[{"id":"v1"}]}"#)]).await;
    let mut headers = BTreeMap::new();
    headers.insert("Authorization".to_string(), "Bearer ${input.token}".to_string());
    let mut query = BTreeMap::new();
    query.insert("channel".to_string(), Value::from("$input.channel"));
    let kind = call(ExternalCallConfig {
        method: "get".to_string(),
        url: format!("{}/videos", server.url),
        headers,
        query,
        ..ExternalCallConfig::default()
    });
    let scope = TemplateScope::new(common::object(json!({"token": "t0k", "channel": "abc"})));

    let output = ExternalCallExecutor::new()
        .execute(context(kind, json!({}), scope, registry(StubGenerator::replying(""))))
        .await
        .unwrap();

    assert_eq!(output.get_segment("status"), Some(&Value::from(200)));
    assert_eq!(
        output.get_path(&["body", "items", "0", "id"]),
        Ok(&Value::from("v1"))
    );
    let request = server.request(0);
    assert!(request.starts_with("GET /videos?channel=abc "));
    assert!(request.to_lowercase().contains("authorization: bearer t0k"));
}

#[tokio::test]
async fn non_success_status_carries_body() {
    let server = serve(vec![(404, r#"{"error":"no such channel"}"#)]).await;
    let kind = StepKind::external_call("GET", format!("{}/missing", server.url));

    let err = ExternalCallExecutor::new()
        .execute(context(
            kind,
            json!({}),
            TemplateScope::default(),
            registry(StubGenerator::replying("")),
        ))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        ExecutorError::HttpStatus {
            status: 404,
            body: r#"{"error":"no such channel"}"#.to_string(),
        }
    );
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn retries_server_errors_when_configured() {
    let server = serve(vec![(503, "busy"), (503, "busy"), (200, r#"{"ok":true}"#)]).await;
    let kind = call(ExternalCallConfig {
        method: "POST".to_string(),
        url: server.url.clone(),
        body: Some(Value::from(json!({"id": "$input.id"}))),
        retry: Some(RetryPolicy {
            max_attempts: 3,
            delay_ms: 5,
            backoff_multiplier: 1.0,
        }),
        ..ExternalCallConfig::default()
    });
    let scope = TemplateScope::new(common::object(json!({"id": 7})));

    let output = ExternalCallExecutor::new()
        .execute(context(kind, json!({}), scope, registry(StubGenerator::replying(""))))
        .await
        .unwrap();

    assert_eq!(output.get_path(&["body", "ok"]), Ok(&Value::Bool(true)));
    assert_eq!(server.hits(), 3);
    assert!(server.request(0).ends_with(r#"{"id":7}"#));
}

#[tokio::test]
async fn does_not_retry_without_policy() {
    let server = serve(vec![(500, "down"), (200, "{}")]).await;
    let kind = StepKind::external_call("GET", server.url.clone());

    let result = ExternalCallExecutor::new()
        .execute(context(
            kind,
            json!({}),
            TemplateScope::default(),
            registry(StubGenerator::replying("")),
        ))
        .await;

    assert!(matches!(result, Err(ExecutorError::HttpStatus { status: 500, .. })));
    assert_eq!(server.hits(), 1);
}

#[test]
fn validate_rejects_bad_method_and_empty_url() {
    let executor = ExternalCallExecutor::new();
    let no_url = StepSpec::new("c", StepKind::external_call("GET", " "));
    assert!(executor.validate(&no_url).is_err());

    let bad_method = StepSpec::new("c", StepKind::external_call("GE T", "http://x"));
    assert!(executor.validate(&bad_method).is_err());
}
