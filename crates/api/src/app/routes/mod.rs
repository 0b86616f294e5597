use axum::Router;

use crate::middleware::scoped;

pub mod apikeys;
pub mod auth;
pub mod system;
pub mod users;

/// Router for every `/api` resource; the permission prefix starts at `leash`.
pub fn router() -> Router {
    Router::new()
        .nest("/users", scoped(users::router(), "users"))
        .nest("/apikeys", apikeys::router())
}
