//! Session REST endpoints for the observer UI.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::session::{CancelStatus, CreateError, SessionOptions, SessionSnapshot};
use crate::state::AppState;

pub const MIN_PROMPT_LENGTH: usize = 1;
pub const MAX_PROMPT_LENGTH: usize = 8000;

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateSessionRequest {
    pub prompt: String,
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub options: Option<SessionOptions>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CreateSessionResponse {
    pub session_id: String,
    pub ws_url: String,
    pub status: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CancelSessionResponse {
    pub status: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ApiError {
    pub message: String,
}

fn bad_request(message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiError {
            message: message.into(),
        }),
    )
}

#[utoipa::path(
    post,
    path = "/api/sessions",
    request_body = CreateSessionRequest,
    responses(
        (status = 201, description = "Session created", body = CreateSessionResponse),
        (status = 400, description = "Validation failure", body = ApiError),
        (status = 503, description = "Concurrency limit reached", body = ApiError)
    ),
    tag = "sessions"
)]
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), (StatusCode, Json<ApiError>)> {
    let prompt_chars = request.prompt.chars().count();
    if prompt_chars < MIN_PROMPT_LENGTH {
        return Err(bad_request("prompt must not be empty"));
    }
    if prompt_chars > MAX_PROMPT_LENGTH {
        return Err(bad_request(format!(
            "prompt length {} exceeds the {} character limit",
            prompt_chars, MAX_PROMPT_LENGTH
        )));
    }
    let options = request.options.unwrap_or_default();
    if options.timeout_sec <= 0.0 {
        return Err(bad_request("timeout_sec must be positive"));
    }
    if let Some(rounds) = options.max_rounds {
        if rounds == 0 {
            return Err(bad_request("max_rounds must be at least 1"));
        }
    }

    tracing::info!(
        counter.magi.session_requests = 1,
        prompt_chars,
        "session create requested"
    );

    match state
        .session_manager
        .create(request.prompt, options)
        .await
    {
        Ok((session_id, ws_url)) => Ok((
            StatusCode::CREATED,
            Json(CreateSessionResponse {
                session_id,
                ws_url,
                status: "QUEUED".to_string(),
            }),
        )),
        Err(CreateError::MaxConcurrency) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError {
                message: "session concurrency limit reached; retry later".to_string(),
            }),
        )),
        Err(CreateError::Engine(err)) => {
            tracing::error!(error = %err, "session engine construction failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError {
                    message: "failed to start session".to_string(),
                }),
            ))
        }
    }
}

#[utoipa::path(
    post,
    path = "/api/sessions/{id}/cancel",
    responses(
        (status = 200, description = "Cancellation state", body = CancelSessionResponse),
        (status = 404, description = "Unknown session", body = ApiError)
    ),
    tag = "sessions"
)]
pub async fn cancel_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<CancelSessionResponse>, (StatusCode, Json<ApiError>)> {
    match state.session_manager.cancel(&id).await {
        Some(status) => {
            let status = match status {
                CancelStatus::Cancelling => "CANCELLING".to_string(),
                CancelStatus::Cancelled => "CANCELLED".to_string(),
                CancelStatus::AlreadyTerminal(phase) => phase.to_string(),
            };
            Ok(Json(CancelSessionResponse { status }))
        }
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ApiError {
                message: format!("unknown session {}", id),
            }),
        )),
    }
}

#[utoipa::path(
    get,
    path = "/api/sessions/{id}",
    responses(
        (status = 200, description = "Session snapshot"),
        (status = 404, description = "Unknown session", body = ApiError)
    ),
    tag = "sessions"
)]
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionSnapshot>, (StatusCode, Json<ApiError>)> {
    match state.session_manager.get(&id).await {
        Some(snapshot) => Ok(Json(snapshot)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ApiError {
                message: format!("unknown session {}", id),
            }),
        )),
    }
}

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/{id}/cancel", post(cancel_session))
        .route("/api/sessions/{id}", get(get_session))
        .with_state(state)
}
