use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::{OwnerContext, TenantContext};

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_dead_letters))
        .route("/:job_id/replay", post(replay_dead_letter))
}

/// GET /dead-letters?limit=N
pub async fn list_dead_letters(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Query(query): Query<dto::ListQuery>,
) -> axum::response::Response {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    match services.jobs.list_dead_letters(tenant.tenant(), limit).await {
        Ok(entries) => Json(
            entries
                .into_iter()
                .map(dto::DeadLetterView::from)
                .collect::<Vec<_>>(),
        )
        .into_response(),
        Err(e) => errors::submit_error_to_response(e),
    }
}

/// POST /dead-letters/:job_id/replay
///
/// Resubmits the payload as a new job; the dead-lettered row is untouched.
pub async fn replay_dead_letter(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(owner): Extension<OwnerContext>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id = match job_id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"),
    };

    match services
        .jobs
        .replay_dead_letter(tenant.tenant(), owner.owner_id(), job_id)
        .await
    {
        Ok(receipt) => (StatusCode::ACCEPTED, Json(receipt)).into_response(),
        Err(e) => errors::submit_error_to_response(e),
    }
}
