use std::sync::Arc;

use axum::{
    extract::{Extension, Query},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use offerdesk_core::QuotaPeriod;

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::TenantContext;

/// GET /quota?period=...
///
/// `period` may be any date or timestamp; it is normalised to its UTC month.
pub async fn get_quota(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Query(query): Query<dto::QuotaQuery>,
) -> axum::response::Response {
    let Some(tenant_id) = tenant.tenant().account_id() else {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "not_metered",
            "system jobs are not subject to quota",
        );
    };

    let period = match query.period.as_deref().map(QuotaPeriod::parse).transpose() {
        Ok(p) => p,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_period", e.to_string()),
    };

    match services.jobs.usage(tenant_id, period.map(|p| p.start())).await {
        Ok(usage) => Json(dto::QuotaView {
            period_start: usage.period_start,
            used: usage.used,
            limit: usage.limit,
            remaining: usage.limit.saturating_sub(usage.used),
        })
        .into_response(),
        Err(e) => errors::submit_error_to_response(e),
    }
}
