use std::sync::Arc;

use axum::Router;
use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use serde_json::json;
use uuid::Uuid;

use crate::api::{AcceptedResponse, ConversationResponse, ExecuteRequest};
use crate::dispatch::ResultDispatcher;
use crate::memory::ConversationMemory;
use crate::orchestrator::ExecutionOrchestrator;

/// Shared handler state. The façade stays thin: request parsing, handler
/// dispatch, and status mapping; all policy lives in the orchestrator.
pub struct AppState {
    pub orchestrator: Arc<ExecutionOrchestrator>,
    pub dispatcher: Arc<ResultDispatcher>,
    pub memory: Arc<ConversationMemory>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/execute", post(execute))
        .route("/execute/async", post(execute_async))
        .route("/iterate", post(iterate))
        .route("/iterate/async", post(iterate_async))
        .route("/conversation/new", post(conversation_new))
        .route("/health", get(health))
        .with_state(state)
}

async fn execute(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ExecuteRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    let request_id = Uuid::new_v4().to_string();
    tracing::info!(%request_id, "execute request");
    let job = req.into_job(request_id.clone());
    let outcome = state.orchestrator.execute_once(&job).await;
    let (status, body) = state.dispatcher.respond(&request_id, &outcome);
    (status, Json(body))
}

async fn iterate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ExecuteRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    let request_id = Uuid::new_v4().to_string();
    tracing::info!(%request_id, "iterate request");
    let job = req.into_job(request_id.clone());
    let outcome = state.orchestrator.iterate_to_completion(&job).await;
    let (status, body) = state.dispatcher.respond(&request_id, &outcome);
    (status, Json(body))
}

async fn execute_async(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ExecuteRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    spawn_async(state, req, false).await
}

async fn iterate_async(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ExecuteRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    spawn_async(state, req, true).await
}

/// Accept the request, run it in the background, and deliver the Result to
/// the caller's webhook.
async fn spawn_async(
    state: Arc<AppState>,
    req: ExecuteRequest,
    iterate: bool,
) -> (StatusCode, Json<serde_json::Value>) {
    let Some(callback_url) = req.callback_url.clone() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "callbackUrl is required for async execution" })),
        );
    };

    let request_id = Uuid::new_v4().to_string();
    tracing::info!(%request_id, iterate, "async request accepted");
    let job = req.into_job(request_id.clone());

    let task_state = state.clone();
    let task_request_id = request_id.clone();
    tokio::spawn(async move {
        let outcome = if iterate {
            task_state.orchestrator.iterate_to_completion(&job).await
        } else {
            task_state.orchestrator.execute_once(&job).await
        };
        let (_, body) = task_state.dispatcher.respond(&task_request_id, &outcome);
        task_state
            .dispatcher
            .deliver_webhook(&callback_url, &body)
            .await;
    });

    let accepted = AcceptedResponse {
        accepted: true,
        request_id,
    };
    (
        StatusCode::OK,
        Json(serde_json::to_value(accepted).unwrap_or_default()),
    )
}

async fn conversation_new(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<serde_json::Value>) {
    let conversation_id = state.memory.force_new_conversation().await;
    let body = ConversationResponse { conversation_id };
    (
        StatusCode::OK,
        Json(serde_json::to_value(body).unwrap_or_default()),
    )
}

async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    let queue = state.orchestrator.queue_status();
    (StatusCode::OK, Json(json!({ "status": "ok", "queue": queue })))
}
