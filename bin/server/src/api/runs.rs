//! Run CRUD and run-level actions.

use super::parse_run_id;
use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use maxq_store::{RunFilter, RunPatch, RunRecord, RunSortBy, RunStatus, SortOrder};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRunRequest {
    pub flow_name: String,
    #[serde(default)]
    pub input: Option<JsonValue>,
    #[serde(default)]
    pub metadata: Option<JsonValue>,
}

/// `POST /api/v1/runs`
pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateRunRequest>,
) -> Result<(StatusCode, Json<RunRecord>), ApiError> {
    let run = state
        .controller
        .create_run(&body.flow_name, body.input, body.metadata)
        .await?;
    Ok((StatusCode::CREATED, Json(run)))
}

/// `GET /api/v1/runs/{id}`
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RunRecord>, ApiError> {
    let run_id = parse_run_id(&id)?;
    let run = state
        .store
        .runs()
        .find_by_id(run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("run '{id}' not found")))?;
    Ok(Json(run))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchRunRequest {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub output: Option<JsonValue>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// `PATCH /api/v1/runs/{id}`
pub async fn patch(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PatchRunRequest>,
) -> Result<Json<RunRecord>, ApiError> {
    let run_id = parse_run_id(&id)?;

    let status = body
        .status
        .as_deref()
        .map(RunStatus::parse)
        .transpose()
        .map_err(|value| ApiError::BadRequest(format!("invalid status '{value}'")))?;

    let patch = RunPatch {
        status,
        output: body.output,
        error: body.error,
        name: body.name,
        description: body.description,
    };

    let run = state
        .store
        .runs()
        .apply_patch(run_id, &patch)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("run '{id}' not found")))?;
    Ok(Json(run))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRunsQuery {
    #[serde(default)]
    pub flow_name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
    #[serde(default)]
    pub sort_by: Option<String>,
    #[serde(default)]
    pub sort_order: Option<String>,
}

/// `GET /api/v1/runs`
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<JsonValue>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(RunStatus::parse)
        .transpose()
        .map_err(|value| ApiError::BadRequest(format!("invalid status '{value}'")))?;

    let sort_by = match query.sort_by.as_deref() {
        None | Some("createdAt") => RunSortBy::CreatedAt,
        Some("completedAt") => RunSortBy::CompletedAt,
        Some(other) => {
            return Err(ApiError::BadRequest(format!("invalid sortBy '{other}'")));
        }
    };
    let sort_order = match query.sort_order.as_deref() {
        None | Some("desc") => SortOrder::Desc,
        Some("asc") => SortOrder::Asc,
        Some(other) => {
            return Err(ApiError::BadRequest(format!("invalid sortOrder '{other}'")));
        }
    };

    let page = state
        .store
        .runs()
        .list(&RunFilter {
            flow_name: query.flow_name,
            status,
            limit: query.limit,
            offset: query.offset,
            sort_by,
            sort_order,
        })
        .await?;

    Ok(Json(json!({
        "data": page.data,
        "pagination": {
            "total": page.total,
            "limit": page.limit,
            "offset": page.offset,
        },
    })))
}

/// `POST /api/v1/runs/{id}/abort`
pub async fn abort(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JsonValue>, ApiError> {
    let run_id = parse_run_id(&id)?;
    let outcome = state.controller.abort(run_id).await?;
    Ok(Json(json!({
        "message": format!("run '{run_id}' aborted"),
        "processesKilled": outcome.processes_killed,
    })))
}

/// `POST /api/v1/runs/{id}/pause`
pub async fn pause(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JsonValue>, ApiError> {
    let run_id = parse_run_id(&id)?;
    let outcome = state.controller.pause(run_id).await?;
    Ok(Json(json!({
        "message": format!("run '{run_id}' paused"),
        "processesKilled": outcome.processes_killed,
    })))
}

/// `POST /api/v1/runs/{id}/resume`
pub async fn resume(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JsonValue>, ApiError> {
    let run_id = parse_run_id(&id)?;
    let run = state.controller.resume(run_id).await?;
    Ok(Json(json!({
        "run": run,
        "message": format!("run '{run_id}' resumed"),
    })))
}

/// `POST /api/v1/runs/{id}/retry`
pub async fn retry(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JsonValue>, ApiError> {
    let run_id = parse_run_id(&id)?;
    let run = state.controller.retry_run(run_id).await?;
    Ok(Json(json!({
        "run": run,
        "message": format!("run '{run_id}' queued for retry"),
    })))
}
