use axum::{Json, http::StatusCode, response::IntoResponse};

use crate::correlator::CallError;
use crate::error::AppError;
use crate::services::tasks::TaskError;

/// Status for a call that failed at the transport level.
pub(crate) fn call_error_status(err: CallError) -> StatusCode {
    match err {
        CallError::NodeOffline => StatusCode::CONFLICT,
        CallError::TimedOut => StatusCode::GATEWAY_TIMEOUT,
        CallError::NodeDisconnected => StatusCode::BAD_GATEWAY,
    }
}

impl From<TaskError> for AppError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::Invalid(msg) => AppError::bad_request(msg),
            TaskError::NotFound => AppError::not_found("task not found"),
            TaskError::NodeNotFound => AppError::not_found("node not found"),
            TaskError::StoreUnavailable(source) => {
                tracing::error!(error = ?source, "task store write failed");
                crate::telemetry::record_internal_error_metrics(&source);
                AppError::store_unavailable("task store unavailable")
            }
        }
    }
}

pub(crate) fn into_response(err: AppError) -> axum::response::Response {
    let body = Json(serde_json::json!({
        "error": err.message,
        "code": err.code,
    }));
    (err.status, body).into_response()
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        into_response(self)
    }
}
