//! Stage scheduling and step-level endpoints.
//!
//! `schedule_stage` is the only way work enters a run: `flow.sh` posts a
//! `{stage, final, steps[]}` batch here. The run-liveness guard rejects
//! terminated and completed runs before any validation or writes, and the
//! DAG resolver rejects malformed batches before any rows exist.

use super::parse_run_id;
use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use maxq_core::validate_name;
use maxq_engine::resolve_levels;
use maxq_store::{RunStatus, StepDef, StepRecord};
use serde::Deserialize;
use serde_json::{json, Map, Value as JsonValue};

#[derive(Debug, Deserialize)]
pub struct ScheduleStageRequest {
    pub stage: String,
    #[serde(rename = "final", default)]
    pub is_final: bool,
    pub steps: Vec<StepDef>,
}

/// `POST /api/v1/runs/{id}/steps`
pub async fn schedule_stage(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ScheduleStageRequest>,
) -> Result<(StatusCode, Json<JsonValue>), ApiError> {
    let run_id = parse_run_id(&id)?;
    let run = state
        .store
        .runs()
        .find_by_id(run_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("run '{id}' not found")))?;

    // Liveness guard: a termination marker blocks all new scheduling
    // until a retry clears it.
    if let Some(reason) = run.termination_reason {
        return Err(ApiError::BadRequest(format!(
            "run '{run_id}' is terminated ({reason:?}); retry the run to schedule new stages"
        )));
    }
    if run.status == RunStatus::Completed {
        return Err(ApiError::BadRequest(format!(
            "run '{run_id}' is already completed"
        )));
    }

    if body.steps.is_empty() {
        return Err(ApiError::BadRequest(
            "steps must not be empty".to_string(),
        ));
    }
    validate_name("stage name", &body.stage)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    for step in &body.steps {
        validate_name("step id", &step.id).map_err(|e| ApiError::BadRequest(e.to_string()))?;
        validate_name("step name", &step.name).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    }

    // Rejects duplicate ids, unknown deps, self-loops and cycles before
    // any side effects.
    resolve_levels(&body.steps).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let (stage, steps) = state
        .store
        .stages()
        .schedule(run_id, &body.stage, body.is_final, &body.steps)
        .await?;

    tracing::info!(
        run_id = %run_id,
        stage = %stage.name,
        steps = steps.len(),
        "stage scheduled"
    );

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "stage": stage,
            "scheduled": steps.len(),
            "steps": steps,
        })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct PostFieldsRequest {
    pub fields: JsonValue,
}

/// `POST /api/v1/runs/{id}/steps/{step_id}/fields`
///
/// Fields are stored verbatim and never influence step status.
pub async fn post_fields(
    State(state): State<AppState>,
    Path((id, step_id)): Path<(String, String)>,
    Json(body): Json<PostFieldsRequest>,
) -> Result<Json<StepRecord>, ApiError> {
    let run_id = parse_run_id(&id)?;

    if !state
        .store
        .steps()
        .set_fields(run_id, &step_id, &body.fields)
        .await?
    {
        return Err(ApiError::NotFound(format!(
            "step '{step_id}' not found in run '{id}'"
        )));
    }

    let step = state
        .store
        .steps()
        .find(run_id, &step_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("step '{step_id}' not found in run '{id}'")))?;
    Ok(Json(step))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetFieldsQuery {
    #[serde(default)]
    pub step_id: Option<String>,
}

/// `GET /api/v1/runs/{id}/fields`
///
/// With `stepId`, returns that step's fields; without it, a
/// `{stepId: fields}` object over every step that posted fields.
pub async fn get_fields(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<GetFieldsQuery>,
) -> Result<Json<JsonValue>, ApiError> {
    let run_id = parse_run_id(&id)?;

    match query.step_id {
        Some(step_id) => {
            let step = state
                .store
                .steps()
                .find(run_id, &step_id)
                .await?
                .ok_or_else(|| {
                    ApiError::NotFound(format!("step '{step_id}' not found in run '{id}'"))
                })?;
            Ok(Json(step.fields.unwrap_or(JsonValue::Null)))
        }
        None => {
            let mut all = Map::new();
            for (step_id, fields) in state.store.steps().fields_by_run(run_id).await? {
                all.insert(step_id, fields);
            }
            Ok(Json(JsonValue::Object(all)))
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryStepRequest {
    #[serde(default)]
    pub cascade_downstream: bool,
}

/// `POST /api/v1/runs/{id}/steps/{step_id}/retry`
pub async fn retry_step(
    State(state): State<AppState>,
    Path((id, step_id)): Path<(String, String)>,
    body: Option<Json<RetryStepRequest>>,
) -> Result<Json<JsonValue>, ApiError> {
    let run_id = parse_run_id(&id)?;
    let cascade = body.map(|Json(b)| b.cascade_downstream).unwrap_or(false);

    let outcome = state
        .controller
        .retry_step(run_id, &step_id, cascade)
        .await?;

    Ok(Json(json!({
        "step": outcome.step,
        "cascadedSteps": outcome.cascaded_steps,
        "message": format!("step '{step_id}' queued for retry"),
    })))
}
