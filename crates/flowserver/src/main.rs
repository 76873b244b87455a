use actix_cors::Cors;
use actix_web::{
    get, post, web, App, HttpResponse, HttpServer, Responder, Result as ActixResult,
};
use actix_ws::Message;
use flowcore::{FlowError, Value, WorkflowDefinition, WorkflowError};
use flowruntime::{ExecutorRegistry, FlowRuntime, RuntimeConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const DEFAULT_LIST_LIMIT: usize = 50;

/// Application state shared across handlers
struct AppState {
    runtime: Arc<FlowRuntime>,
}

/// Request body for workflow execution
#[derive(Debug, Default, Deserialize)]
struct ExecuteRequest {
    #[serde(default)]
    inputs: BTreeMap<String, Value>,
}

/// Request body for running an unregistered definition
#[derive(Debug, Deserialize)]
struct InlineExecuteRequest {
    workflow: WorkflowDefinition,
    #[serde(default)]
    inputs: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

impl ListQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT)
    }
}

/// Response for workflow registration
#[derive(Debug, Serialize)]
struct WorkflowResponse {
    id: String,
    waves: Vec<Vec<String>>,
    message: String,
}

/// Error response
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(err: &FlowError) -> HttpResponse {
    let body = ErrorResponse {
        error: err.to_string(),
    };
    match err {
        FlowError::Workflow(WorkflowError::NotFound(_)) => HttpResponse::NotFound().json(body),
        FlowError::Workflow(_) | FlowError::Graph(_) => HttpResponse::BadRequest().json(body),
        _ => HttpResponse::InternalServerError().json(body),
    }
}

/// Health check endpoint
#[get("/health")]
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "flowengine"
    }))
}

/// List all registered workflows
#[get("/api/workflows")]
async fn list_workflows(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let workflows = data.runtime.list_workflows().await;
    let workflow_list: Vec<_> = workflows
        .iter()
        .map(|w| {
            serde_json::json!({
                "id": w.id,
                "name": w.name,
                "version": w.version,
                "description": w.description,
                "steps": w.steps.len(),
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(workflow_list))
}

/// Register a workflow definition
#[post("/api/workflows")]
async fn create_workflow(
    data: web::Data<AppState>,
    workflow: web::Json<WorkflowDefinition>,
) -> ActixResult<impl Responder> {
    let workflow = workflow.into_inner();
    let workflow_id = workflow.id.clone();

    info!("Registering workflow: {} ({})", workflow.name, workflow_id);

    let plan = match data.runtime.validate(&workflow) {
        Ok(plan) => plan,
        Err(e) => {
            warn!("Rejected workflow {}: {}", workflow_id, e);
            return Ok(error_response(&e));
        }
    };
    if let Err(e) = data.runtime.register_workflow(workflow).await {
        return Ok(error_response(&e));
    }

    Ok(HttpResponse::Created().json(WorkflowResponse {
        id: workflow_id,
        waves: plan.into_waves(),
        message: "Workflow registered successfully".to_string(),
    }))
}

/// Get a specific workflow
#[get("/api/workflows/{id}")]
async fn get_workflow(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> ActixResult<impl Responder> {
    let workflow_id = path.into_inner();

    match data.runtime.get_workflow(&workflow_id).await {
        Some(workflow) => Ok(HttpResponse::Ok().json(workflow)),
        None => Ok(HttpResponse::NotFound().json(ErrorResponse {
            error: format!("Workflow {} not found", workflow_id),
        })),
    }
}

/// Delete a workflow
#[actix_web::delete("/api/workflows/{id}")]
async fn delete_workflow(
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> ActixResult<impl Responder> {
    let workflow_id = path.into_inner();

    match data.runtime.remove_workflow(&workflow_id).await {
        Some(_) => {
            info!("Deleted workflow: {}", workflow_id);
            Ok(HttpResponse::Ok().json(serde_json::json!({
                "message": "Workflow deleted successfully"
            })))
        }
        None => Ok(HttpResponse::NotFound().json(ErrorResponse {
            error: format!("Workflow {} not found", workflow_id),
        })),
    }
}

/// Execute a registered workflow
#[post("/api/workflows/{id}/execute")]
async fn execute_workflow(
    data: web::Data<AppState>,
    path: web::Path<String>,
    req: Option<web::Json<ExecuteRequest>>,
) -> ActixResult<impl Responder> {
    let workflow_id = path.into_inner();
    let inputs = req.map(|r| r.into_inner().inputs).unwrap_or_default();

    info!("Executing workflow: {}", workflow_id);

    match data.runtime.execute_workflow(&workflow_id, inputs).await {
        Ok(execution) => {
            info!(
                "Workflow {} finished as {} (execution {})",
                workflow_id, execution.status, execution.id
            );
            Ok(HttpResponse::Ok().json(execution.as_ref()))
        }
        Err(e) => Ok(error_response(&e)),
    }
}

/// Execute a definition supplied in the request body
#[post("/api/execute")]
async fn execute_inline(
    data: web::Data<AppState>,
    req: web::Json<InlineExecuteRequest>,
) -> ActixResult<impl Responder> {
    let InlineExecuteRequest { workflow, inputs } = req.into_inner();

    info!("Executing inline workflow: {}", workflow.id);

    let execution = data.runtime.execute(&workflow, inputs).await;
    Ok(HttpResponse::Ok().json(execution.as_ref()))
}

/// Most recent executions, newest first
#[get("/api/executions")]
async fn list_executions(
    data: web::Data<AppState>,
    query: web::Query<ListQuery>,
) -> ActixResult<impl Responder> {
    let executions = data.runtime.list_recent(query.limit()).await;
    let records: Vec<_> = executions.iter().map(|e| e.as_ref()).collect();
    Ok(HttpResponse::Ok().json(records))
}

#[get("/api/executions/stats")]
async fn execution_stats(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    Ok(HttpResponse::Ok().json(data.runtime.stats().await))
}

#[get("/api/executions/{id}")]
async fn get_execution(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
) -> ActixResult<impl Responder> {
    let execution_id = path.into_inner();

    match data.runtime.get_execution(&execution_id).await {
        Some(execution) => Ok(HttpResponse::Ok().json(execution.as_ref())),
        None => Ok(HttpResponse::NotFound().json(ErrorResponse {
            error: format!("Execution {} not found", execution_id),
        })),
    }
}

#[get("/api/workflows/{id}/executions")]
async fn list_workflow_executions(
    data: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<ListQuery>,
) -> ActixResult<impl Responder> {
    let workflow_id = path.into_inner();
    let executions = data
        .runtime
        .list_by_workflow(&workflow_id, query.limit())
        .await;
    let records: Vec<_> = executions.iter().map(|e| e.as_ref()).collect();
    Ok(HttpResponse::Ok().json(records))
}

/// WebSocket endpoint for real-time events
#[get("/api/events")]
async fn websocket_events(
    req: actix_web::HttpRequest,
    stream: web::Payload,
    data: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let (res, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;

    info!("WebSocket client connected");

    let mut events = data.runtime.subscribe_events();

    actix_web::rt::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            if let Ok(json) = serde_json::to_string(&event) {
                                if session.text(json).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("WebSocket client lagged, dropped {} events", skipped);
                        }
                        Err(_) => break,
                    }
                }

                Some(Ok(msg)) = msg_stream.recv() => {
                    match msg {
                        Message::Ping(bytes) => {
                            if session.pong(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }

                else => break,
            }
        }

        info!("WebSocket client disconnected");
        let _ = session.close(None).await;
    });

    Ok(res)
}

/// List available step kinds
#[get("/api/kinds")]
async fn list_kinds(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let registry = data.runtime.registry();
    let kinds: Vec<_> = registry
        .list_kinds()
        .iter()
        .filter_map(|kind| registry.get_metadata(kind))
        .collect();

    Ok(HttpResponse::Ok().json(kinds))
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("🚀 Starting Flow Engine Server");

    let config = RuntimeConfig::from_env();
    let mut registry = ExecutorRegistry::new();
    flownodes::register_all(&mut registry);
    let runtime = FlowRuntime::with_registry(registry, config);

    info!("✅ Runtime initialized with standard step kinds");

    let app_state = web::Data::new(AppState {
        runtime: Arc::new(runtime),
    });

    let bind_address =
        std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

    info!("🌐 Server starting on http://{}", bind_address);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(app_state.clone())
            .wrap(cors)
            .wrap(actix_web::middleware::Logger::default())
            .service(health_check)
            .service(list_workflows)
            .service(create_workflow)
            .service(get_workflow)
            .service(delete_workflow)
            .service(execute_workflow)
            .service(list_workflow_executions)
            .service(execute_inline)
            .service(list_executions)
            .service(execution_stats)
            .service(get_execution)
            .service(websocket_events)
            .service(list_kinds)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    Ok(())
}
