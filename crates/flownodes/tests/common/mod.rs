#![allow(dead_code)]

use async_trait::async_trait;
use flowcore::{
    EventBus, ExecutorError, StepContext, StepKind, TemplateScope, Value,
};
use flownodes::{GenerationRequest, GenerationResponse, TextGenerator};
use flowruntime::ExecutorRegistry;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub fn object(json: serde_json::Value) -> BTreeMap<String, Value> {
    match Value::from(json) {
        Value::Object(map) => map,
        _ => BTreeMap::new(),
    }
}

pub fn registry(generator: Arc<dyn TextGenerator>) -> Arc<ExecutorRegistry> {
    let mut registry = ExecutorRegistry::new();
    flownodes::register_with_generator(&mut registry, generator);
    Arc::new(registry)
}

/// Context for calling an executor directly, outside a workflow run.
pub fn context(
    kind: StepKind,
    inputs: serde_json::Value,
    scope: TemplateScope,
    registry: Arc<ExecutorRegistry>,
) -> StepContext {
    let execution_id = Uuid::new_v4();
    let bus = EventBus::new(64);
    StepContext {
        execution_id,
        step_id: "step".to_string(),
        kind,
        inputs: object(inputs),
        scope: Arc::new(scope),
        events: bus.create_emitter(execution_id, "step"),
        cancellation: CancellationToken::new(),
        dispatcher: registry,
    }
}

/// Generator that returns canned text and remembers the requests it saw.
pub struct StubGenerator {
    reply: String,
    pub requests: Mutex<Vec<GenerationRequest>>,
}

impl StubGenerator {
    pub fn replying(reply: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.into(),
            requests: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl TextGenerator for StubGenerator {
    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResponse, ExecutorError> {
        let model = request.model.clone().unwrap_or_else(|| "stub".to_string());
        self.requests.lock().unwrap().push(request);
        Ok(GenerationResponse {
            text: self.reply.clone(),
            model,
        })
    }
}

/// Minimal HTTP/1.1 server answering each connection with the next canned
/// response (the last one repeats).
pub struct StubServer {
    pub url: String,
    pub requests: Arc<Mutex<Vec<String>>>,
}

impl StubServer {
    pub fn hits(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn request(&self, index: usize) -> String {
        self.requests.lock().unwrap()[index].clone()
    }
}

pub async fn serve(responses: Vec<(u16, &'static str)>) -> StubServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let requests = Arc::new(Mutex::new(Vec::new()));
    let seen = requests.clone();

    tokio::spawn(async move {
        let mut served = 0;
        while let Ok((mut socket, _)) = listener.accept().await {
            let request = read_request(&mut socket).await;
            seen.lock().unwrap().push(request);

            let (status, body) = responses[served.min(responses.len() - 1)];
            served += 1;
            let response = format!(
                "HTTP/1.1 {} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });

    StubServer { url, requests }
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = socket.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        let text = String::from_utf8_lossy(&buf);
        if let Some(end) = text.find("\r\n\r\n") {
            let length = text[..end]
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())
                        .flatten()
                })
                .unwrap_or(0);
            if buf.len() >= end + 4 + length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}
