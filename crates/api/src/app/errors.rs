use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use offerdesk_infra::jobs::{JobStoreError, SubmitError};

pub fn submit_error_to_response(err: SubmitError) -> axum::response::Response {
    match err {
        SubmitError::QuotaExceeded { used, limit } => json_error(
            StatusCode::TOO_MANY_REQUESTS,
            "quota_exceeded",
            format!("monthly quota of {limit} jobs reached ({used} used)"),
        ),
        SubmitError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        SubmitError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
        SubmitError::NotReady(status) => json_error(
            StatusCode::CONFLICT,
            "not_ready",
            format!("job is {status}"),
        ),
        SubmitError::InvalidToken => {
            json_error(StatusCode::FORBIDDEN, "invalid_token", "invalid download token")
        }
        SubmitError::Store(JobStoreError::NotFound(_)) => {
            json_error(StatusCode::NOT_FOUND, "not_found", "job not found")
        }
        SubmitError::Store(e) => {
            tracing::error!(error = %e, "job store error");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
        SubmitError::Quota(e) => {
            tracing::error!(error = %e, "quota ledger error");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "quota_error", e.to_string())
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
