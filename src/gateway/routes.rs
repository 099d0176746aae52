use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use super::errors::admin_error;
use super::handler::handle_chat;
use super::GatewayAppState;
use crate::format::WireFormat;
use crate::providers::ProviderCircuitStatus;
use crate::shared::clock::now_unix_seconds;

/// Inline base64 images make chat bodies much larger than axum's 2 MiB default.
const MAX_REQUEST_BODY_BYTES: usize = 32 * 1024 * 1024;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    app: &'static str,
    version: &'static str,
    ts: u64,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        app: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        ts: now_unix_seconds(),
    })
}

async fn root() -> &'static str {
    "AIO relay gateway is running"
}

async fn anthropic_messages(State(state): State<GatewayAppState>, body: Bytes) -> Response {
    handle_chat(state, WireFormat::Anthropic, body).await
}

async fn openai_chat_completions(State(state): State<GatewayAppState>, body: Bytes) -> Response {
    handle_chat(state, WireFormat::OpenAi, body).await
}

#[derive(Debug, Serialize)]
struct ModelObject {
    id: String,
    object: &'static str,
    owned_by: String,
}

#[derive(Debug, Serialize)]
struct ModelList {
    object: &'static str,
    data: Vec<ModelObject>,
}

async fn list_models(State(state): State<GatewayAppState>) -> Json<ModelList> {
    let data = state
        .router
        .list_models()
        .into_iter()
        .map(|m| ModelObject {
            id: m.id,
            object: "model",
            owned_by: m.owned_by,
        })
        .collect();
    Json(ModelList {
        object: "list",
        data,
    })
}

async fn circuits(State(state): State<GatewayAppState>) -> Json<Vec<ProviderCircuitStatus>> {
    Json(state.router.registry().circuit_statuses())
}

async fn reset_circuit(
    State(state): State<GatewayAppState>,
    Path(provider): Path<String>,
) -> Response {
    match state.router.registry().reset_circuit(&provider) {
        Some(status) => Json(status).into_response(),
        None => admin_error(
            StatusCode::NOT_FOUND,
            "GW_PROVIDER_NOT_FOUND",
            format!("provider `{provider}` is not registered"),
        ),
    }
}

pub fn build_router(state: GatewayAppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/v1/messages", post(anthropic_messages))
        .route("/v1/chat/completions", post(openai_chat_completions))
        .route("/v1/models", get(list_models))
        .route("/admin/circuits", get(circuits))
        .route("/admin/circuits/:provider/reset", post(reset_circuit))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .with_state(state)
}
