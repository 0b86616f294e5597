//! API keys, both per user (`/users/{self|:user_id}/apikeys`) and global
//! (`/apikeys/:key`). A key's grants live on its `apikey:<key>` subject.
//!
//! A key may only carry grants that both its owner and the caller hold, and
//! turning on `full_access` needs `<prefix>:full_access`.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Query},
    http::StatusCode,
    middleware::from_fn,
    routing::{delete, get, patch, post},
};
use tracing::info;

use leash_auth::{AuthError, Permission, Subject, authorize};
use leash_core::{ApiKey, User};

use crate::app::dto::{
    ApiKeyResponse, CreateApiKeyRequest, ListQuery, ListResponse, UpdateApiKeyRequest, parse_permissions,
};
use crate::app::errors::ApiError;
use crate::app::services::AppServices;
use crate::context::{RequestContext, TargetApiKey, TargetUser};
use crate::middleware::{guarded, load_any_api_key, load_user_api_key, require, scoped};

/// `/apikeys/:key`: any key, behind `leash.apikeys:target`.
pub fn router() -> Router {
    let single = require(single_key_router().layer(from_fn(load_any_api_key)), "target");
    scoped(Router::new().nest("/:key", single), "apikeys")
}

/// `<user>/apikeys`: keys owned by the target user.
pub fn user_router() -> Router {
    let single = require(single_key_router().layer(from_fn(load_user_api_key)), "target");
    let routes = Router::new()
        .route("/", guarded(get(list_keys), "list"))
        .route("/", guarded(post(create_key), "create"))
        .nest("/:key", single);
    scoped(routes, "apikeys")
}

fn single_key_router() -> Router {
    Router::new()
        .route("/", guarded(get(get_key), "get"))
        .route("/", guarded(patch(update_key), "update"))
        .route("/", guarded(delete(delete_key), "delete"))
}

/// GET `<user>/apikeys` - page through the target user's keys
pub async fn list_keys(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(TargetUser(user)): Extension<TargetUser>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse<ApiKeyResponse>>, ApiError> {
    let keys = services.store.list_api_keys(user.id).await?;
    let data = query
        .page(&keys)
        .iter()
        .map(|k| ApiKeyResponse::new(k, &services.policy))
        .collect();
    Ok(Json(ListResponse {
        data,
        total: keys.len(),
    }))
}

fn check_grantable(
    services: &AppServices,
    ctx: &RequestContext,
    owner: &User,
    permissions: &[Permission],
    full_access: bool,
) -> Result<(), ApiError> {
    if full_access {
        let permission = ctx
            .prefix()
            .action("full_access")
            .map_err(|e| AuthError::infrastructure(e.to_string()))?;
        authorize(&services.policy, ctx.auth(), &permission).map_err(AuthError::from)?;
    }
    for permission in permissions {
        if !services.policy.authorize_user(owner, permission) {
            return Err(AuthError::Unauthorized(permission.clone()).into());
        }
        authorize(&services.policy, ctx.auth(), permission).map_err(AuthError::from)?;
    }
    Ok(())
}

/// POST `<user>/apikeys` - mint a key for the target user
pub async fn create_key(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Extension(TargetUser(user)): Extension<TargetUser>,
    Json(req): Json<CreateApiKeyRequest>,
) -> Result<(StatusCode, Json<ApiKeyResponse>), ApiError> {
    let permissions = parse_permissions(&req.permissions)?;
    check_grantable(&services, &ctx, &user, &permissions, req.full_access)?;
    let key = ApiKey::generate(user.id, req.description, req.full_access);

    services.store.insert_api_key(&key).await?;
    services.policy.set_permissions(&Subject::for_api_key(&key), permissions);
    services.policy.save_policy().await?;

    info!(key = %key.fingerprint(), user_id = %user.id, full_access = key.full_access, "api key created");
    Ok((StatusCode::CREATED, Json(ApiKeyResponse::new(&key, &services.policy))))
}

pub async fn get_key(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(TargetApiKey(key)): Extension<TargetApiKey>,
) -> Json<ApiKeyResponse> {
    Json(ApiKeyResponse::new(&key, &services.policy))
}

/// PATCH - change description, full access and/or replace the grant list
pub async fn update_key(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Extension(TargetApiKey(mut key)): Extension<TargetApiKey>,
    Json(req): Json<UpdateApiKeyRequest>,
) -> Result<Json<ApiKeyResponse>, ApiError> {
    let permissions = req.permissions.as_deref().map(parse_permissions).transpose()?;
    let enabling_full_access = req.full_access == Some(true) && !key.full_access;
    if enabling_full_access || permissions.is_some() {
        let owner = services
            .store
            .find_user(key.user_id)
            .await?
            .ok_or(ApiError::NotFound("user"))?;
        check_grantable(
            &services,
            &ctx,
            &owner,
            permissions.as_deref().unwrap_or_default(),
            enabling_full_access,
        )?;
    }

    if let Some(description) = req.description {
        key.description = description;
    }
    if let Some(full_access) = req.full_access {
        key.full_access = full_access;
    }
    services.store.update_api_key(&key).await?;

    if let Some(permissions) = permissions {
        services.policy.set_permissions(&Subject::for_api_key(&key), permissions);
        services.policy.save_policy().await?;
    }

    info!(key = %key.fingerprint(), "api key updated");
    Ok(Json(ApiKeyResponse::new(&key, &services.policy)))
}

/// DELETE - revoke the key and drop its grants
pub async fn delete_key(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(TargetApiKey(key)): Extension<TargetApiKey>,
) -> Result<StatusCode, ApiError> {
    services.store.delete_api_key(&key.key).await?;
    if services.policy.remove_subject(&Subject::for_api_key(&key)) {
        services.policy.save_policy().await?;
    }
    info!(key = %key.fingerprint(), "api key deleted");
    Ok(StatusCode::NO_CONTENT)
}
