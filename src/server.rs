//! HTTP/WebSocket transport over the `App` façade
//!
//! Handlers translate requests into registry operations and errors into
//! `{ "error", "kind" }` payloads. `GET /api/scripts/{id}/logs` upgrades to
//! a WebSocket that forwards every output line of the task until the peer
//! goes away.

use crate::app::{App, TaskSummary};
use crate::core::{ExecutionRun, TaskKind};
use crate::error::TaskError;
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

type AppState = Arc<App>;

impl TaskError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::AlreadyExists(_) => StatusCode::CONFLICT,
            Self::InvalidInput(_) | Self::MetadataParse { .. } => StatusCode::BAD_REQUEST,
            Self::SandboxTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::SandboxFailure(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for TaskError {
    fn into_response(self) -> Response {
        let body = json!({ "error": self.to_string(), "kind": self.kind() });
        (self.status_code(), Json(body)).into_response()
    }
}

/// Create request
#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// Update or draft request
#[derive(Debug, Deserialize)]
pub struct ContentRequest {
    pub content: String,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// Build the API router
pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .route("/api/scripts", get(list_scripts).post(create_script))
        .route(
            "/api/scripts/{id}",
            get(get_script).put(update_script).delete(delete_script),
        )
        .route("/api/scripts/{id}/toggle", post(toggle_script))
        .route("/api/scripts/{id}/temp", put(save_draft))
        .route("/api/scripts/{id}/run", post(run_script))
        .route("/api/scripts/{id}/logs", get(logs))
        .route("/api/utils", get(list_utils).post(create_util))
        .route("/api/utils/{id}", get(get_util).put(update_util).delete(delete_util))
        .with_state(app)
}

/// Serve the API until Ctrl+C
pub async fn serve(app: Arc<App>, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    log::info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router(app))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::warn!("Failed to listen for shutdown signal: {}", e);
            }
            log::info!("Shutting down");
        })
        .await?;
    Ok(())
}

fn list(app: &App, kind: TaskKind) -> Result<Json<Vec<TaskSummary>>, TaskError> {
    app.list_tasks(kind).map(Json)
}

fn create(app: &App, kind: TaskKind, req: CreateRequest) -> Result<(StatusCode, Json<TaskSummary>), TaskError> {
    let task = app.create_task(kind, &req.name, &req.content, req.schedule.as_deref(), req.enabled)?;
    Ok((StatusCode::CREATED, Json(task)))
}

fn update(app: &App, kind: TaskKind, id: &str, req: ContentRequest) -> Result<Json<TaskSummary>, TaskError> {
    app.update_task(kind, id, &req.content, req.schedule.as_deref(), req.enabled)
        .map(Json)
}

async fn list_scripts(State(app): State<AppState>) -> Result<Json<Vec<TaskSummary>>, TaskError> {
    list(&app, TaskKind::Scheduled)
}

async fn create_script(
    State(app): State<AppState>,
    Json(req): Json<CreateRequest>,
) -> Result<(StatusCode, Json<TaskSummary>), TaskError> {
    create(&app, TaskKind::Scheduled, req)
}

async fn get_script(State(app): State<AppState>, Path(id): Path<String>) -> Result<Json<TaskSummary>, TaskError> {
    app.get_task(TaskKind::Scheduled, &id).map(Json)
}

async fn update_script(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ContentRequest>,
) -> Result<Json<TaskSummary>, TaskError> {
    update(&app, TaskKind::Scheduled, &id, req)
}

async fn delete_script(State(app): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, TaskError> {
    app.delete_task(TaskKind::Scheduled, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn toggle_script(State(app): State<AppState>, Path(id): Path<String>) -> Result<Json<TaskSummary>, TaskError> {
    app.toggle_task(&id).map(Json)
}

async fn save_draft(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ContentRequest>,
) -> Result<StatusCode, TaskError> {
    app.set_draft(&id, &req.content, req.schedule.as_deref(), req.enabled)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn run_script(State(app): State<AppState>, Path(id): Path<String>) -> Result<Json<ExecutionRun>, TaskError> {
    app.run_now(&id).await?.into_result().map(Json)
}

async fn list_utils(State(app): State<AppState>) -> Result<Json<Vec<TaskSummary>>, TaskError> {
    list(&app, TaskKind::Utility)
}

async fn create_util(
    State(app): State<AppState>,
    Json(req): Json<CreateRequest>,
) -> Result<(StatusCode, Json<TaskSummary>), TaskError> {
    create(&app, TaskKind::Utility, req)
}

async fn get_util(State(app): State<AppState>, Path(id): Path<String>) -> Result<Json<TaskSummary>, TaskError> {
    app.get_task(TaskKind::Utility, &id).map(Json)
}

async fn update_util(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ContentRequest>,
) -> Result<Json<TaskSummary>, TaskError> {
    update(&app, TaskKind::Utility, &id, req)
}

async fn delete_util(State(app): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, TaskError> {
    app.delete_task(TaskKind::Utility, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// WebSocket upgrade handler for a task's live output
async fn logs(ws: WebSocketUpgrade, State(app): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_logs(socket, app, id))
}

async fn stream_logs(socket: WebSocket, app: Arc<App>, id: String) {
    let mut observer = app.subscribe(&id);
    let handle = observer.handle().clone();
    let (mut sender, mut receiver) = socket.split();
    log::info!("Log viewer connected to {}", handle.task_id);

    loop {
        tokio::select! {
            line = observer.recv() => {
                let Some(line) = line else { break };
                if sender.send(Message::Text(line.into())).await.is_err() {
                    break;
                }
            }
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            },
        }
    }

    app.unsubscribe(&handle);
    log::info!("Log viewer disconnected from {}", handle.task_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(TaskError::NotFound("a.js".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(TaskError::AlreadyExists("a.js".into()).status_code(), StatusCode::CONFLICT);
        assert_eq!(TaskError::InvalidInput("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            TaskError::SandboxTimeout(Duration::from_secs(5)).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            TaskError::SandboxFailure("boom".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_create_request_defaults() {
        let req: CreateRequest = serde_json::from_str(r#"{"name":"ping","content":"console.log(1)"}"#).unwrap();
        assert_eq!(req.schedule, None);
        assert_eq!(req.enabled, None);
    }
}
