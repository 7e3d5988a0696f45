use actix_cors::Cors;
use actix_web::{get, post, web, App, HttpResponse, HttpServer, Responder, Result as ActixResult};
use actix_ws::Message;
use flowcore::{FlowDefinition, FlowError, Map, StoreError, Value, WorkflowError};
use flowruntime::{CallbackOutcome, DefinitionSource, FlowRuntime, RuntimeConfig};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Application state shared across handlers
struct AppState {
    runtime: Arc<FlowRuntime>,
}

/// Request body for flow execution
#[derive(Debug, Deserialize)]
struct ExecuteRequest {
    #[serde(default)]
    inputs: Map,
    #[serde(default)]
    version: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct VersionQuery {
    version: Option<u32>,
}

/// Response for flow registration
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FlowResponse {
    id: String,
    version: u32,
    message: String,
}

/// Error response
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Map an engine error onto an HTTP status
fn error_response(e: &FlowError) -> HttpResponse {
    let body = ErrorResponse { error: e.to_string() };
    match e {
        FlowError::Workflow(WorkflowError::NotFound(_))
        | FlowError::Store(StoreError::NotFound { .. })
        | FlowError::CallbackNotFound(_) => HttpResponse::NotFound().json(body),
        FlowError::Workflow(WorkflowError::Disabled(_)) => HttpResponse::Conflict().json(body),
        FlowError::Workflow(_) | FlowError::Serialization(_) => HttpResponse::BadRequest().json(body),
        _ => {
            error!("Request failed: {}", e);
            HttpResponse::InternalServerError().json(body)
        }
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

/// List the latest version of every published flow
#[get("/api/flows")]
async fn list_flows(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let flows: Vec<_> = data
        .runtime
        .definitions()
        .list()
        .await
        .iter()
        .map(|f| {
            serde_json::json!({
                "id": f.id,
                "version": f.version,
                "name": f.name,
                "description": f.description,
                "enabled": f.enabled,
                "nodes": f.graph.nodes.len(),
                "edges": f.graph.edges.len(),
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(flows))
}

/// Publish a flow definition (or a new version of one)
#[post("/api/flows")]
async fn register_flow(
    data: web::Data<AppState>,
    definition: web::Json<FlowDefinition>,
) -> ActixResult<impl Responder> {
    let definition = definition.into_inner();
    let (id, version) = (definition.id.clone(), definition.version);

    info!(flow_id = %id, version, "Publishing flow: {}", definition.name);

    match data.runtime.register_flow(definition).await {
        Ok(()) => Ok(HttpResponse::Created().json(FlowResponse {
            id,
            version,
            message: "Flow published successfully".to_string(),
        })),
        Err(e) => Ok(error_response(&e)),
    }
}

/// Get a published flow, latest version unless `?version=` is given
#[get("/api/flows/{id}")]
async fn get_flow(
    data: web::Data<AppState>,
    path: web::Path<String>,
    query: web::Query<VersionQuery>,
) -> ActixResult<impl Responder> {
    let flow_id = path.into_inner();
    match data.runtime.definitions().get_published(&flow_id, query.version).await {
        Ok(definition) => Ok(HttpResponse::Ok().json(definition.as_ref())),
        Err(e) => Ok(error_response(&FlowError::from(e))),
    }
}

/// Execute a flow; responds with the run's record once it completes,
/// fails or pauses
#[post("/api/flows/{id}/execute")]
async fn execute_flow(
    data: web::Data<AppState>,
    path: web::Path<String>,
    req: web::Json<ExecuteRequest>,
) -> ActixResult<impl Responder> {
    let flow_id = path.into_inner();
    let ExecuteRequest { inputs, version } = req.into_inner();

    info!(flow_id = %flow_id, "Executing flow");

    match data.runtime.execute(&flow_id, version, inputs).await {
        Ok(record) => {
            info!(flow_id = %flow_id, execution_id = %record.id, status = ?record.status, "Execution returned");
            Ok(HttpResponse::Ok().json(record))
        }
        Err(e) => {
            error!(flow_id = %flow_id, "Execution failed to start: {}", e);
            Ok(error_response(&e))
        }
    }
}

#[get("/api/executions")]
async fn list_executions(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    match data.runtime.list_executions().await {
        Ok(records) => Ok(HttpResponse::Ok().json(records)),
        Err(e) => Ok(error_response(&e)),
    }
}

#[get("/api/executions/{id}")]
async fn get_execution(data: web::Data<AppState>, path: web::Path<Uuid>) -> ActixResult<impl Responder> {
    let execution_id = path.into_inner();
    match data.runtime.get_execution(execution_id).await {
        Ok(Some(record)) => Ok(HttpResponse::Ok().json(record)),
        Ok(None) => Ok(HttpResponse::NotFound().json(ErrorResponse {
            error: format!("Execution {} not found", execution_id),
        })),
        Err(e) => Ok(error_response(&e)),
    }
}

/// Node execution records of one run, in execution order
#[get("/api/executions/{id}/nodes")]
async fn get_node_executions(data: web::Data<AppState>, path: web::Path<Uuid>) -> ActixResult<impl Responder> {
    match data.runtime.node_executions(path.into_inner()).await {
        Ok(records) => Ok(HttpResponse::Ok().json(records)),
        Err(e) => Ok(error_response(&e)),
    }
}

/// Resume a paused run directly with a payload
#[post("/api/executions/{id}/resume")]
async fn resume_execution(
    data: web::Data<AppState>,
    path: web::Path<Uuid>,
    payload: web::Json<serde_json::Value>,
) -> ActixResult<impl Responder> {
    let execution_id = path.into_inner();
    match data.runtime.resume(execution_id, Value::from(payload.into_inner())).await {
        Ok(Some(record)) => Ok(HttpResponse::Ok().json(record)),
        Ok(None) => Ok(HttpResponse::Conflict().json(ErrorResponse {
            error: format!("Execution {} is not paused", execution_id),
        })),
        Err(e) => Ok(error_response(&e)),
    }
}

/// Inbound asynchronous reply for a paused node
#[post("/api/callback/{key}")]
async fn receive_callback(
    data: web::Data<AppState>,
    path: web::Path<String>,
    payload: Option<web::Json<serde_json::Value>>,
) -> ActixResult<impl Responder> {
    let key = path.into_inner();
    let payload = payload.map(|p| Value::from(p.into_inner())).unwrap_or_default();

    match data.runtime.handle_callback(&key, payload).await {
        Ok(CallbackOutcome::Resumed(record)) => Ok(HttpResponse::Ok().json(serde_json::json!({
            "status": "resumed",
            "executionId": record.id,
            "executionStatus": record.status,
        }))),
        Ok(CallbackOutcome::Deferred) => Ok(HttpResponse::Accepted().json(serde_json::json!({
            "status": "accepted",
        }))),
        Ok(CallbackOutcome::Ignored(status)) => {
            warn!(callback_key = %key, ?status, "Duplicate callback");
            Ok(HttpResponse::Ok().json(serde_json::json!({
                "status": "ignored",
                "callbackStatus": status,
            })))
        }
        Ok(CallbackOutcome::Expired) => Ok(HttpResponse::Gone().json(ErrorResponse {
            error: format!("Callback {} expired", key),
        })),
        Err(e) => Ok(error_response(&e)),
    }
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
                            warn!(skipped, "WebSocket client lagging; events dropped");
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

/// List available node types
#[get("/api/nodes")]
async fn list_node_types(data: web::Data<AppState>) -> ActixResult<impl Responder> {
    let registry = data.runtime.registry();
    let nodes: Vec<_> = registry
        .list_node_types()
        .iter()
        .map(|node_type| {
            let metadata = registry.get_metadata(node_type);
            serde_json::json!({
                "type": node_type,
                "description": metadata.as_ref().map(|m| m.description.clone()).unwrap_or_default(),
                "category": metadata.as_ref().map(|m| m.category.clone()).unwrap_or_default(),
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(nodes))
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🚀 Starting Flow Engine Server");

    let runtime = Arc::new(FlowRuntime::with_config(
        flownodes::standard_registry(),
        RuntimeConfig::default(),
    ));
    let sweeper = runtime.spawn_expiry_sweeper(Duration::from_secs(60));

    info!("✅ Runtime initialized with standard nodes");

    let app_state = web::Data::new(AppState { runtime });

    let bind_address = std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

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
            .service(list_flows)
            .service(register_flow)
            .service(get_flow)
            .service(execute_flow)
            .service(list_executions)
            .service(get_execution)
            .service(get_node_executions)
            .service(resume_execution)
            .service(receive_callback)
            .service(websocket_events)
            .service(list_node_types)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    sweeper.abort();
    Ok(())
}
