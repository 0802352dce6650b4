use std::{collections::HashSet, sync::Arc, time::Instant};

use axum::{
    Extension, Json, Router,
    body::Bytes,
    extract::Path,
    http::{Method, StatusCode, Uri},
    routing::{get, post},
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use super::auth::{CallbackAuth, CallbackGuard};
use crate::editor::EditorBridge;
use crate::path_safety::ensure_single_segment;
use crate::persistence::{ResultPersistence, now_rfc3339};

pub const EXTENSION_NAME: &str = "prism-bridge";

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

#[derive(Clone)]
pub struct ServerState {
    pub auth: CallbackAuth,
    pub persistence: Arc<ResultPersistence>,
    pub editor: Arc<dyn EditorBridge>,
    pub started_at: Instant,
    pub executions: Arc<Mutex<HashSet<String>>>,
    pub completions: broadcast::Sender<String>,
}

pub fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/api/workspace", get(workspace))
        .route("/api/command", post(execute_command))
        .route("/api/editor", get(active_editor))
        .route("/api/prismatic/status", get(status))
        .route(
            "/api/executions/{execution_id}/step-result",
            post(ingest_step_result),
        )
        .route(
            "/api/executions/{execution_id}/complete",
            post(complete_execution),
        )
        .fallback(not_found)
        .layer(Extension(state))
}

async fn root() -> Json<Value> {
    Json(json!({
        "message": "Prismatic callback server",
        "timestamp": now_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn health(Extension(state): Extension<ServerState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime": state.started_at.elapsed().as_secs_f64(),
    }))
}

async fn workspace(Extension(state): Extension<ServerState>) -> Json<Value> {
    Json(json!(state.editor.workspace()))
}

#[derive(Debug, Deserialize)]
struct CommandRequest {
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<Value>,
}

async fn execute_command(
    Extension(state): Extension<ServerState>,
    Json(req): Json<CommandRequest>,
) -> ApiResult {
    let command = req
        .command
        .filter(|command| !command.trim().is_empty())
        .ok_or_else(|| bad_request("command is required"))?;
    match state.editor.execute_command(&command, req.args).await {
        Ok(result) => Ok(Json(json!({ "success": true, "result": result }))),
        Err(err) => {
            warn!(%command, %err, "command passthrough failed");
            Err(bad_request(&err.to_string()))
        }
    }
}

async fn active_editor(Extension(state): Extension<ServerState>) -> ApiResult {
    state
        .editor
        .active_editor()
        .map(|info| Json(json!(info)))
        .ok_or((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "No active editor" })),
        ))
}

async fn status(Extension(state): Extension<ServerState>) -> Json<Value> {
    Json(json!({
        "extension": EXTENSION_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "serverRunning": true,
        "activeSessions": state.executions.lock().len(),
    }))
}

async fn ingest_step_result(
    _guard: CallbackGuard,
    Extension(state): Extension<ServerState>,
    Path(execution_id): Path<String>,
    body: Bytes,
) -> ApiResult {
    ensure_single_segment(&execution_id).map_err(|err| bad_request(&err.to_string()))?;
    // Remote flows do not always send a JSON content type.
    let body: Value = serde_json::from_slice(&body)
        .map_err(|err| bad_request(&format!("invalid JSON body: {err}")))?;
    let step_name = body
        .get("stepName")
        .and_then(Value::as_str)
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| bad_request("stepName is required"))?
        .to_owned();
    let data = body.get("data").cloned().unwrap_or(Value::Null);
    let timestamp = body
        .get("timestamp")
        .and_then(Value::as_str)
        .map(str::to_owned);

    if let Err(err) = state
        .persistence
        .write_step_result(&execution_id, &step_name, data, timestamp)
    {
        error!(%execution_id, %step_name, ?err, "failed to save step result");
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "error": format!("{err:#}") })),
        ));
    }
    state.executions.lock().insert(execution_id.clone());

    Ok(Json(json!({
        "success": true,
        "message": "Step result saved",
        "executionId": execution_id,
        "stepName": step_name,
    })))
}

async fn complete_execution(
    _guard: CallbackGuard,
    Extension(state): Extension<ServerState>,
    Path(execution_id): Path<String>,
) -> ApiResult {
    ensure_single_segment(&execution_id).map_err(|err| bad_request(&err.to_string()))?;
    info!(%execution_id, "execution reported completion");
    // No receivers just means no run is waiting on this execution.
    let _ = state.completions.send(execution_id.clone());
    Ok(Json(json!({ "success": true, "executionId": execution_id })))
}

async fn not_found(method: Method, uri: Uri) -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "Route not found",
            "method": method.as_str(),
            "path": uri.path(),
        })),
    )
}

fn bad_request(message: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "success": false, "error": message })),
    )
}
