//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: backends, the job service and background tasks
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router over already-started services.
pub fn build_app(jwt_secret: String, services: Arc<services::AppServices>) -> Router {
    let jwt = Arc::new(offerdesk_auth::Hs256JwtValidator::new(jwt_secret.into_bytes()));
    let auth_state = middleware::AuthState { jwt };

    // Protected routes: require auth + tenant context.
    let protected = routes::router()
        .layer(Extension(services.clone()))
        .layer(axum::middleware::from_fn_with_state(
            auth_state,
            middleware::auth_middleware,
        ));

    let public = routes::jobs::public_router()
        .route("/metrics", get(routes::system::metrics))
        .layer(Extension(services));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(public)
        .merge(protected)
        .layer(ServiceBuilder::new())
}
