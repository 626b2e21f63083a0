use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use snippet_exec::{state::OperationInfo, RunnerConfig, SnippetService, Tool};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("Service error: {0}")]
    Service(#[from] snippet_exec::Error),
    #[error("Server error: {0}")]
    ServerError(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ServerError::UnknownTool(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::Service(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::ServerError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub available_slots: usize,
    pub active_operations: Vec<OperationInfo>,
    pub tools: Vec<&'static str>,
}

#[derive(Clone)]
pub struct AppState {
    service: SnippetService,
}

pub fn create_app(config: RunnerConfig) -> Result<Router, ServerError> {
    let service = SnippetService::new(config)?;
    Ok(router(service))
}

pub fn router(service: SnippetService) -> Router {
    let state = AppState { service };

    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status))
        .route("/code", post(code))
        .route("/tests", post(tests))
        .route("/python", post(python))
        .route("/tools/:name", post(tool))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run_server(app: Router, addr: SocketAddr) -> Result<(), ServerError> {
    info!("Starting snippet execution server on {}", addr);
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::ServerError(e.to_string()))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| ServerError::ServerError(e.to_string()))?;

    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let service = &state.service;
    Json(StatusResponse {
        available_slots: service.get_available_slots(),
        active_operations: service.active_operations(),
        tools: service.tools().iter().map(|t| t.name()).collect(),
    })
}

async fn code(
    State(state): State<AppState>,
    Json(params): Json<Value>,
) -> Json<snippet_exec::Response> {
    Json(state.service.code(params).await)
}

async fn tests(
    State(state): State<AppState>,
    Json(params): Json<Value>,
) -> Json<snippet_exec::Response> {
    Json(state.service.tests(params).await)
}

async fn python(
    State(state): State<AppState>,
    Json(params): Json<Value>,
) -> Json<snippet_exec::Response> {
    Json(state.service.python(params).await)
}

async fn tool(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(params): Json<Value>,
) -> Result<Json<snippet_exec::Response>, ServerError> {
    let Some(tool) = state.service.tools().into_iter().find(|t| t.name() == name) else {
        error!("Request for unknown tool {}", name);
        return Err(ServerError::UnknownTool(name));
    };
    Ok(Json(tool.handle(params).await))
}
