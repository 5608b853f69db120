use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use offerdesk_core::Tenant;

use crate::app::errors;
use crate::app::services::AppServices;
use crate::context::{OwnerContext, TenantContext};

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn whoami(
    Extension(tenant): Extension<TenantContext>,
    Extension(owner): Extension<OwnerContext>,
) -> impl IntoResponse {
    let tenant_id = match tenant.tenant() {
        Tenant::System => None,
        Tenant::Account(id) => Some(id.to_string()),
    };
    Json(serde_json::json!({
        "tenant": tenant.tenant().to_string(),
        "tenant_id": tenant_id,
        "owner_id": owner.owner_id().to_string(),
    }))
}

/// GET /metrics
///
/// Latest exporter snapshot, collected on demand if none exists yet.
pub async fn metrics(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    if let Some(snapshot) = services.metrics.latest() {
        return Json(snapshot).into_response();
    }
    match services.metrics.collect().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string()),
    }
}
