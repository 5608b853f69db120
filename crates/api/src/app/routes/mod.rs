use axum::{routing::get, Router};

pub mod dead_letters;
pub mod jobs;
pub mod quota;
pub mod system;

/// Router for all authenticated (tenant-scoped) endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .route("/quota", get(quota::get_quota))
        .nest("/jobs", jobs::router())
        .nest("/dead-letters", dead_letters::router())
}
