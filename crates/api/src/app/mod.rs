//! HTTP application wiring.
//!
//! - `services.rs`: stores, policy engine, token codec and login manager
//! - `routes/`: handlers, one file per resource
//! - `dto.rs`: request/response shapes
//! - `errors.rs`: error to response mapping

use std::sync::Arc;

use axum::{Extension, Router, middleware::from_fn_with_state, routing::get};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router (public entrypoint used by `main.rs` and the
/// black-box tests).
pub fn build_app(services: Arc<services::AppServices>) -> Router {
    let api = routes::router().layer(from_fn_with_state(services.clone(), middleware::authenticate));

    Router::new()
        .route("/health", get(routes::system::health))
        .nest("/auth", routes::auth::router(services.clone()))
        .nest("/api", api)
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
