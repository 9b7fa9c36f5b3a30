//! Health endpoint.

use crate::state::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value as JsonValue};

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<JsonValue>) {
    match state.store.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "services": { "store": "up" },
            })),
        ),
        Err(e) => {
            tracing::error!(error = %e, "health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "services": { "store": "down" },
                })),
            )
        }
    }
}
