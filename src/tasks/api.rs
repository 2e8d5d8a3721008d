//! REST + WebSocket surface of the dispatch queue.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{CompleteTaskRequest, CreateTaskRequest, FailTaskRequest, TaskEvent, TaskType};
use super::queue::DispatchQueue;
use crate::anycards::routes::anycard_routes;
use crate::config::AuthConfig;
use crate::error::{DatabaseError, TaskError};
use crate::supervisor::{RedeemAllSupervisor, redeem_all_routes};

/// Shared state for the task routes.
#[derive(Clone)]
pub struct TaskRouteState {
    pub queue: Arc<DispatchQueue>,
}

fn error_body(status: StatusCode, code: &str, message: String) -> Response {
    (status, Json(json!({"error": code, "message": message}))).into_response()
}

impl IntoResponse for TaskError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        match self {
            TaskError::NotFound { .. }
            | TaskError::Database(DatabaseError::NotFound { .. }) => {
                error_body(StatusCode::NOT_FOUND, "not_found", message)
            }
            TaskError::AlreadyTerminal { .. } | TaskError::NotInProgress { .. } => {
                error_body(StatusCode::CONFLICT, "conflict", message)
            }
            TaskError::UnknownType(_) | TaskError::InvalidRequest(_) => {
                error_body(StatusCode::BAD_REQUEST, "bad_request", message)
            }
            TaskError::Database(e) => {
                warn!(error = %e, "Task store error");
                error_body(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Task store unavailable".to_string(),
                )
            }
        }
    }
}

/// Ids that do not parse cannot name a stored task.
fn parse_id(raw: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw.trim()).map_err(|_| {
        error_body(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("Task not found: {raw}"),
        )
    })
}

/// POST /api/tasks
async fn create_task(
    State(state): State<TaskRouteState>,
    Json(req): Json<CreateTaskRequest>,
) -> Response {
    match state.queue.create(req).await {
        Ok(task) => Json(task).into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /api/tasks
async fn list_tasks(State(state): State<TaskRouteState>) -> Response {
    match state.queue.list().await {
        Ok(tasks) => Json(tasks).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct NextParams {
    #[serde(rename = "type")]
    task_type: Option<String>,
}

/// GET /api/tasks/next?type=
///
/// 200 with the leased task, or 204 when nothing can be leased right now.
async fn next_task(State(state): State<TaskRouteState>, Query(params): Query<NextParams>) -> Response {
    let Some(raw) = params.task_type.filter(|t| !t.trim().is_empty()) else {
        return StatusCode::NO_CONTENT.into_response();
    };
    let task_type: TaskType = match raw.parse() {
        Ok(t) => t,
        Err(e) => return TaskError::into_response(e),
    };
    match state.queue.next(task_type).await {
        Ok(Some(task)) => Json(task).into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /api/tasks/{id}
async fn get_task(State(state): State<TaskRouteState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.queue.get(id).await {
        Ok(task) => Json(task).into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /api/tasks/{id}/complete
async fn complete_task(
    State(state): State<TaskRouteState>,
    Path(id): Path<String>,
    Json(req): Json<CompleteTaskRequest>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.queue.complete(id, req.result).await {
        Ok(task) => Json(task).into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /api/tasks/{id}/fail
async fn fail_task(
    State(state): State<TaskRouteState>,
    Path(id): Path<String>,
    Json(req): Json<FailTaskRequest>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.queue.fail(id, &req.error, req.result).await {
        Ok(task) => Json(task).into_response(),
        Err(e) => e.into_response(),
    }
}

/// DELETE /api/tasks/{id}
async fn delete_task(State(state): State<TaskRouteState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.queue.delete(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<TaskRouteState>) -> impl IntoResponse {
    info!("Task WebSocket client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn send_event(socket: &mut WebSocket, event: &TaskEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize task event");
            true
        }
    }
}

async fn send_sync(socket: &mut WebSocket, state: &TaskRouteState) -> bool {
    match state.queue.list().await {
        Ok(tasks) => send_event(socket, &TaskEvent::TasksSync { tasks }).await,
        Err(e) => {
            warn!(error = %e, "Failed to load tasks for sync");
            true
        }
    }
}

async fn handle_socket(mut socket: WebSocket, state: TaskRouteState) {
    // Subscribe before the initial sync so nothing falls between the two.
    let mut rx = state.queue.subscribe();

    if !send_sync(&mut socket, &state).await {
        warn!("Failed to send initial task sync, client disconnected");
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if !send_event(&mut socket, &event).await {
                            debug!("Task WS client disconnected during send");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "Task WS client lagged behind broadcast");
                        if !send_sync(&mut socket, &state).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Task broadcast channel closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Task WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Task WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Build the task REST + WS routes.
pub fn task_routes(queue: Arc<DispatchQueue>) -> Router {
    Router::new()
        .route("/api/tasks", get(list_tasks).post(create_task))
        .route("/api/tasks/create", post(create_task))
        .route("/api/tasks/next", get(next_task))
        .route("/api/tasks/{id}", get(get_task).delete(delete_task))
        .route("/api/tasks/{id}/complete", post(complete_task))
        .route("/api/tasks/{id}/fail", post(fail_task))
        .route("/ws/tasks", get(ws_handler))
        .with_state(TaskRouteState { queue })
}

/// Check the shared Basic credential. Failures get a bare 401 with no challenge
/// header, so browsers never pop a login dialog.
pub async fn require_basic_auth(
    State(auth): State<Arc<AuthConfig>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let authorized = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Basic ").or_else(|| h.strip_prefix("basic ")))
        .and_then(|encoded| STANDARD.decode(encoded.trim()).ok())
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .is_some_and(|pair| match pair.split_once(':') {
            Some((user, pass)) => {
                user == auth.username && pass == auth.password.expose_secret()
            }
            None => false,
        });

    if !authorized {
        debug!(path = %req.uri().path(), "Rejected unauthenticated request");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    next.run(req).await
}

/// GET /health
async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// The full bridge HTTP surface: tasks, anycards, redeem-all, behind Basic auth,
/// plus an open health check.
pub fn bridge_router(
    queue: Arc<DispatchQueue>,
    supervisor: Arc<RedeemAllSupervisor>,
    auth: AuthConfig,
) -> Router {
    let protected = task_routes(queue.clone())
        .merge(anycard_routes(queue.db().clone()))
        .merge(redeem_all_routes(supervisor))
        .layer(middleware::from_fn_with_state(
            Arc::new(auth),
            require_basic_auth,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(CorsLayer::permissive())
}
