//! Request pipeline: identity resolution, permission-prefix nesting and
//! the terminal authorization guard.
//!
//! ```text
//! authenticate ─▶ scope("users") ─▶ require("target_self") ─▶ scope("self") ─▶ require("get") ─▶ handler
//!   leash            leash.users      leash.users:target_self   leash.users.self   leash.users.self:get
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Extension, Path, Request, State},
    http::{HeaderMap, header},
    middleware::{Next, from_fn_with_state},
    response::Response,
    routing::MethodRouter,
};
use tracing::debug;

use leash_auth::{AuthError, AuthenticationContext, authorize, explain_authorization};
use leash_core::UserId;

use crate::app::errors::ApiError;
use crate::app::services::AppServices;
use crate::context::{RequestContext, TargetApiKey, TargetUser};

/// Resolve the `Authorization` header into a [`RequestContext`] rooted at `leash`.
///
/// Never rejects on its own; an unusable credential is simply logged out.
pub async fn authenticate(
    State(services): State<Arc<AppServices>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = authorization_header(req.headers());
    let auth = services.resolver.resolve(header).await?;
    debug!(context = auth.kind(), "request authenticated");

    req.extensions_mut().insert(RequestContext::new(auth));
    Ok(next.run(req).await)
}

fn authorization_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok())
}

/// Session endpoints are for people; API keys get a 400.
pub async fn reject_api_keys(Extension(ctx): Extension<RequestContext>, req: Request, next: Next) -> Result<Response, ApiError> {
    if matches!(ctx.auth(), AuthenticationContext::ApiKey { .. }) {
        return Err(ApiError::bad_request("API keys cannot be used with session endpoints"));
    }
    Ok(next.run(req).await)
}

async fn nest_prefix(State(segment): State<&'static str>, mut req: Request, next: Next) -> Result<Response, ApiError> {
    let ctx = req
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .ok_or(AuthError::Unauthenticated)?;
    let prefix = ctx
        .prefix()
        .nest(segment)
        .map_err(|e| AuthError::infrastructure(e.to_string()))?;
    req.extensions_mut().insert(ctx.with_prefix(prefix));
    Ok(next.run(req).await)
}

async fn require_action(
    State(action): State<&'static str>,
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let permission = ctx
        .prefix()
        .action(action)
        .map_err(|e| AuthError::infrastructure(e.to_string()))?;
    if let Err(err) = authorize(&services.policy, ctx.auth(), &permission) {
        let explanation = explain_authorization(&services.policy, ctx.auth(), &permission);
        debug!(%permission, reason = %explanation.reason, "request denied");
        return Err(AuthError::from(err).into());
    }
    Ok(next.run(req).await)
}

/// Extend the permission prefix by `segment` for every route of `router`.
pub fn scoped(router: Router, segment: &'static str) -> Router {
    router.layer(from_fn_with_state(segment, nest_prefix))
}

/// Require `<prefix>:<action>` before any route of `router` runs.
pub fn require(router: Router, action: &'static str) -> Router {
    router.layer(from_fn_with_state(action, require_action))
}

/// Require `<prefix>:<action>` for this one method route.
pub fn guarded(route: MethodRouter, action: &'static str) -> MethodRouter {
    route.route_layer(from_fn_with_state(action, require_action))
}

/// Target the caller themself.
pub async fn load_self(Extension(ctx): Extension<RequestContext>, mut req: Request, next: Next) -> Result<Response, ApiError> {
    let user = ctx.auth().user().cloned().ok_or(AuthError::Unauthenticated)?;
    req.extensions_mut().insert(TargetUser(user));
    Ok(next.run(req).await)
}

/// Target the user named by the `:user_id` path parameter.
pub async fn load_user(
    Extension(services): Extension<Arc<AppServices>>,
    Path(params): Path<HashMap<String, String>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let user_id: UserId = params
        .get("user_id")
        .ok_or_else(|| ApiError::bad_request("missing user id"))?
        .parse()
        .map_err(|_| ApiError::bad_request("invalid user id"))?;
    let user = services
        .store
        .find_user(user_id)
        .await?
        .ok_or(ApiError::NotFound("user"))?;
    req.extensions_mut().insert(TargetUser(user));
    Ok(next.run(req).await)
}

/// Load `:key`, which must belong to the target user.
pub async fn load_user_api_key(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(TargetUser(owner)): Extension<TargetUser>,
    Path(params): Path<HashMap<String, String>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let key = params.get("key").ok_or_else(|| ApiError::bad_request("missing key"))?;
    let api_key = services
        .store
        .find_api_key(key)
        .await?
        .filter(|k| k.user_id == owner.id)
        .ok_or(ApiError::NotFound("API key"))?;
    req.extensions_mut().insert(TargetApiKey(api_key));
    Ok(next.run(req).await)
}

/// Load `:key` regardless of owner.
pub async fn load_any_api_key(
    Extension(services): Extension<Arc<AppServices>>,
    Path(params): Path<HashMap<String, String>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let key = params.get("key").ok_or_else(|| ApiError::bad_request("missing key"))?;
    let api_key = services
        .store
        .find_api_key(key)
        .await?
        .ok_or(ApiError::NotFound("API key"))?;
    req.extensions_mut().insert(TargetApiKey(api_key));
    Ok(next.run(req).await)
}
