//! HTTP error mapping.
//!
//! Domain errors carry stable phrases; this module translates them into
//! status codes and a JSON `{ "error": ... }` body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use maxq_engine::ControllerError;
use maxq_store::StoreError;
use serde_json::json;

/// An error ready to leave the HTTP boundary.
#[derive(Debug)]
pub enum ApiError {
    /// 400: validation or precondition failure.
    BadRequest(String),
    /// 404: unknown run, stage or step.
    NotFound(String),
    /// 409: action conflicts with the run's current state.
    Conflict(String),
    /// 500: store failure or engine bug.
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> &str {
        match self {
            Self::BadRequest(m) | Self::NotFound(m) | Self::Conflict(m) | Self::Internal(m) => m,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if matches!(self, Self::Internal(_)) {
            tracing::error!(error = %self.message(), "internal error at HTTP boundary");
        }
        (self.status(), Json(json!({ "error": self.message() }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<ControllerError> for ApiError {
    fn from(e: ControllerError) -> Self {
        let message = e.to_string();
        match e {
            ControllerError::FlowNotFound { .. }
            | ControllerError::InvalidName { .. }
            | ControllerError::RunAlreadyTerminal { .. }
            | ControllerError::RunNotPaused { .. }
            | ControllerError::RunCompleted { .. }
            | ControllerError::StepNotFailed { .. } => Self::BadRequest(message),
            ControllerError::RunNotFound { .. } | ControllerError::StepNotFound { .. } => {
                Self::NotFound(message)
            }
            ControllerError::RunInProgress { .. } => Self::Conflict(message),
            ControllerError::Store(e) => Self::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maxq_core::RunId;

    #[test]
    fn controller_errors_map_to_expected_statuses() {
        let run_id = RunId::new();

        let cases: Vec<(ControllerError, StatusCode)> = vec![
            (
                ControllerError::FlowNotFound {
                    flow_name: "x".to_string(),
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                ControllerError::RunNotFound { run_id },
                StatusCode::NOT_FOUND,
            ),
            (
                ControllerError::RunAlreadyTerminal { run_id },
                StatusCode::BAD_REQUEST,
            ),
            (
                ControllerError::RunInProgress { run_id },
                StatusCode::CONFLICT,
            ),
            (
                ControllerError::StepNotFailed {
                    step_id: "s".to_string(),
                },
                StatusCode::BAD_REQUEST,
            ),
        ];

        for (error, expected) in cases {
            let api: ApiError = error.into();
            assert_eq!(api.status(), expected);
        }
    }
}
