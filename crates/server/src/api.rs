use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use datapilot_agent::AgentRuntime;
use datapilot_core::{ApplicationError, InterfaceError};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct ApiState {
    pub runtime: Arc<AgentRuntime>,
}

#[derive(Debug, Deserialize)]
pub struct TurnRequest {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct TurnResponse {
    pub thread_id: String,
    pub answer: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'static str,
    message: &'static str,
    detail: String,
    correlation_id: &'a str,
}

pub fn router(runtime: Arc<AgentRuntime>) -> Router {
    Router::new()
        .route("/api/v1/threads/{thread_id}/turns", post(run_turn))
        .with_state(ApiState { runtime })
}

async fn run_turn(
    State(state): State<ApiState>,
    Path(thread_id): Path<String>,
    Json(request): Json<TurnRequest>,
) -> Response {
    let correlation_id = Uuid::new_v4().to_string();

    match state.runtime.run_turn(&thread_id, &request.text).await {
        Ok(answer) => {
            info!(
                event_name = "api.turn.completed",
                correlation_id = %correlation_id,
                thread_id = %thread_id,
                "turn completed"
            );
            (StatusCode::OK, Json(TurnResponse { thread_id, answer })).into_response()
        }
        Err(error) => {
            let interface = ApplicationError::from(error).into_interface(correlation_id);
            warn!(
                event_name = "api.turn.failed",
                correlation_id = %interface.correlation_id(),
                thread_id = %thread_id,
                error = %interface,
                "turn failed"
            );
            error_response(&interface)
        }
    }
}

fn error_response(error: &InterfaceError) -> Response {
    let (status, kind, detail) = match error {
        InterfaceError::BadRequest { message, .. } => (StatusCode::BAD_REQUEST, "bad_request", message),
        InterfaceError::ServiceUnavailable { message, .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", message)
        }
        InterfaceError::Internal { message, .. } => {
            (StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
        }
    };

    let body = ErrorBody {
        error: kind,
        message: error.user_message(),
        detail: detail.clone(),
        correlation_id: error.correlation_id(),
    };
    (status, Json(body)).into_response()
}
