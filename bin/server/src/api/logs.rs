//! Run log endpoints.

use super::parse_run_id;
use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use maxq_store::{LogEntityType, LogLevel, RunLogFilter, RunLogRecord};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLogRequest {
    pub entity_type: String,
    #[serde(default)]
    pub entity_id: Option<String>,
    pub level: String,
    pub message: String,
    #[serde(default)]
    pub metadata: Option<JsonValue>,
}

/// `POST /api/v1/runs/{id}/logs`
pub async fn create(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<CreateLogRequest>,
) -> Result<(StatusCode, Json<RunLogRecord>), ApiError> {
    let run_id = parse_run_id(&id)?;
    if state.store.runs().find_by_id(run_id).await?.is_none() {
        return Err(ApiError::NotFound(format!("run '{id}' not found")));
    }

    let entity_type = LogEntityType::parse(&body.entity_type)
        .map_err(|value| ApiError::BadRequest(format!("invalid entityType '{value}'")))?;
    let level = LogLevel::parse(&body.level)
        .map_err(|value| ApiError::BadRequest(format!("invalid level '{value}'")))?;

    let record = RunLogRecord::new(
        run_id,
        entity_type,
        body.entity_id,
        level,
        body.message,
        body.metadata,
    );
    state.store.run_logs().create(&record).await?;

    Ok((StatusCode::CREATED, Json(record)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListLogsQuery {
    #[serde(default)]
    pub entity_type: Option<String>,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub before: Option<String>,
    #[serde(default)]
    pub after: Option<String>,
}

fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>, ApiError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| ApiError::BadRequest(format!("invalid {field} timestamp '{value}'")))
}

/// `GET /api/v1/runs/{id}/logs`
pub async fn list(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ListLogsQuery>,
) -> Result<Json<JsonValue>, ApiError> {
    let run_id = parse_run_id(&id)?;

    let entity_type = query
        .entity_type
        .as_deref()
        .map(LogEntityType::parse)
        .transpose()
        .map_err(|value| ApiError::BadRequest(format!("invalid entityType '{value}'")))?;
    let level = query
        .level
        .as_deref()
        .map(LogLevel::parse)
        .transpose()
        .map_err(|value| ApiError::BadRequest(format!("invalid level '{value}'")))?;
    let before = query
        .before
        .as_deref()
        .map(|v| parse_timestamp("before", v))
        .transpose()?;
    let after = query
        .after
        .as_deref()
        .map(|v| parse_timestamp("after", v))
        .transpose()?;

    let logs = state
        .store
        .run_logs()
        .list(
            run_id,
            &RunLogFilter {
                entity_type,
                entity_id: query.entity_id,
                level,
                limit: query.limit,
                before,
                after,
            },
        )
        .await?;

    Ok(Json(json!({
        "count": logs.len(),
        "logs": logs,
    })))
}
