//! Route table for the `/api/v1` surface.

pub mod health;
pub mod logs;
pub mod runs;
pub mod steps;

use crate::error::ApiError;
use crate::state::AppState;
use axum::routing::{get, post};
use axum::Router;
use maxq_core::RunId;
use std::str::FromStr;

/// Builds the full application router.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/runs", post(runs::create).get(runs::list))
        .route("/api/v1/runs/{id}", get(runs::get).patch(runs::patch))
        .route("/api/v1/runs/{id}/abort", post(runs::abort))
        .route("/api/v1/runs/{id}/pause", post(runs::pause))
        .route("/api/v1/runs/{id}/resume", post(runs::resume))
        .route("/api/v1/runs/{id}/retry", post(runs::retry))
        .route("/api/v1/runs/{id}/steps", post(steps::schedule_stage))
        .route("/api/v1/runs/{id}/fields", get(steps::get_fields))
        .route(
            "/api/v1/runs/{id}/steps/{step_id}/fields",
            post(steps::post_fields),
        )
        .route(
            "/api/v1/runs/{id}/steps/{step_id}/retry",
            post(steps::retry_step),
        )
        .route("/api/v1/runs/{id}/logs", post(logs::create).get(logs::list))
        .route("/health", get(health::health))
        .with_state(state)
}

/// Parses a run id path segment; unknown formats read as "no such run".
pub(crate) fn parse_run_id(raw: &str) -> Result<RunId, ApiError> {
    RunId::from_str(raw).map_err(|_| ApiError::NotFound(format!("run '{raw}' not found")))
}
