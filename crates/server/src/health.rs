use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use datapilot_db::{ping, DbPool};
use datapilot_mcp::{BackendStatus, McpToolProvider, SessionState};
use serde::Serialize;

#[derive(Clone)]
pub struct HealthState {
    pub db_pool: DbPool,
    pub tools: Arc<McpToolProvider>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub database: HealthCheck,
    pub backends: HealthCheck,
    pub backend_status: Vec<BackendStatus>,
    pub checked_at: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let backend_status = state.tools.backend_status().await;
    let backends = backends_check(&backend_status);
    let ready = database.status == "ready" && backends.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "datapilot-server runtime initialized".to_string(),
        },
        database,
        backends,
        backend_status,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match ping(pool).await {
        Ok(()) => HealthCheck { status: "ready", detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: "degraded", detail: format!("database query failed: {error}") }
        }
    }
}

fn backends_check(statuses: &[BackendStatus]) -> HealthCheck {
    if statuses.is_empty() {
        return HealthCheck { status: "ready", detail: "no tool backends configured".to_string() };
    }

    let failed: Vec<&str> = statuses
        .iter()
        .filter(|status| status.state == SessionState::Failed)
        .map(|status| status.name.as_str())
        .collect();

    if failed.is_empty() {
        HealthCheck {
            status: "ready",
            detail: format!("{} tool backend(s) reachable", statuses.len()),
        }
    } else {
        HealthCheck {
            status: "degraded",
            detail: format!("unreachable tool backends: {}", failed.join(", ")),
        }
    }
}
