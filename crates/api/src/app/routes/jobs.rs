use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Redirect,
    },
    routing::{get, post},
    Json, Router,
};
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};

use offerdesk_infra::jobs::{JobId, StatusMessage, SubmitRequest};

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::{OwnerContext, TenantContext};

/// Authenticated job endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/", post(submit_job))
        .route("/:id", get(get_job))
        .route("/:id/stream", get(stream_job))
}

/// Download links are handed to end users, so the token is the only credential.
pub fn public_router() -> Router {
    Router::new().route("/jobs/:id/download", get(download_job))
}

fn parse_job_id(id: &str) -> Result<JobId, axum::response::Response> {
    id.parse()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"))
}

/// POST /jobs
///
/// Admits the job against the tenant's quota and returns immediately.
pub async fn submit_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Extension(owner): Extension<OwnerContext>,
    Json(body): Json<dto::SubmitJobRequest>,
) -> axum::response::Response {
    let request = SubmitRequest {
        tenant: tenant.tenant(),
        owner_id: owner.owner_id(),
        payload: body.payload,
        callback_url: body.callback_url,
    };

    match services.jobs.submit(request).await {
        Ok(receipt) => (StatusCode::ACCEPTED, Json(receipt)).into_response(),
        Err(e) => errors::submit_error_to_response(e),
    }
}

/// GET /jobs/:id
pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.jobs.status(tenant.tenant(), job_id).await {
        Ok(job) => Json(dto::JobView::from(job)).into_response(),
        Err(e) => errors::submit_error_to_response(e),
    }
}

/// GET /jobs/:id/stream
///
/// Server-Sent Events: the current `status` first, then one per change, and
/// `heartbeat` while idle. The stream ends by itself once the job is terminal
/// or the channel times out.
pub async fn stream_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    // Ownership check before any subscription is opened.
    let current = match services.jobs.status(tenant.tenant(), job_id).await {
        Ok(job) => job,
        Err(e) => return errors::submit_error_to_response(e),
    };
    let heartbeat = services.status.config().heartbeat_interval;

    // The current state goes first; the feed continues from it.
    let first = tokio_stream::once(StatusMessage::Update(current.snapshot()));
    let rest = if current.status.is_terminal() {
        // Nothing follows a terminal state.
        let (_, closed) = mpsc::channel(1);
        closed
    } else {
        services.status.open_after(&current).messages
    };

    let stream = first.chain(ReceiverStream::new(rest)).map(|msg| {
        let event = match msg {
            StatusMessage::Update(snapshot) => match SseEvent::default().event("status").json_data(&snapshot) {
                Ok(event) => event,
                Err(e) => SseEvent::default().event("error").data(e.to_string()),
            },
            StatusMessage::Heartbeat => SseEvent::default().event("heartbeat").data("{}"),
        };
        Ok::<_, Infallible>(event)
    });

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(heartbeat.max(Duration::from_secs(1))))
        .into_response()
}

/// GET /jobs/:id/download?token=...
pub async fn download_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Query(query): Query<dto::DownloadQuery>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.jobs.download(job_id, &query.token).await {
        Ok(url) => Redirect::temporary(&url).into_response(),
        Err(e) => errors::submit_error_to_response(e),
    }
}
