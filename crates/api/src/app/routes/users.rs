//! `/users` resource routes.
//!
//! `self` and `:user_id` share one handler set; only the prefix segment
//! (`self` vs `others`) and the targeting permission differ.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    middleware::from_fn,
    routing::{get, patch, post, put},
};
use tracing::info;

use leash_auth::{AuthError, Role, Subject, authorize, roles};
use leash_core::{NewUser, User, normalize_email};

use crate::app::dto::{
    CheckinTokenResponse, CreateUserRequest, SetPermissionsRequest, UpdateUserRequest, UserResponse,
    parse_permissions,
};
use crate::app::errors::ApiError;
use crate::app::routes::apikeys;
use crate::app::services::AppServices;
use crate::context::{RequestContext, TargetUser};
use crate::middleware::{guarded, load_self, load_user, require, scoped};

/// Mounted under `/users` with the prefix already at `leash.users`.
pub fn router() -> Router {
    let lookups = Router::new()
        .route("/email/:email", guarded(get(get_by_email), "email"))
        .route("/checkin/:token", guarded(get(get_by_checkin), "checkin"));

    Router::new()
        .route("/", guarded(post(create_user), "create"))
        .nest("/self", require(scoped(user_routes().layer(from_fn(load_self)), "self"), "target_self"))
        .nest("/get", scoped(lookups, "get"))
        .nest(
            "/:user_id",
            require(scoped(user_routes().layer(from_fn(load_user)), "others"), "target_others"),
        )
}

fn user_routes() -> Router {
    Router::new()
        .route("/", guarded(get(get_user), "get"))
        .route("/", guarded(patch(update_user), "update"))
        .route("/permissions", guarded(get(get_permissions), "permissions"))
        .route("/permissions", guarded(put(set_permissions), "set_permissions"))
        .route("/checkin", guarded(get(checkin_token), "checkin"))
        .nest("/apikeys", apikeys::user_router())
}

fn known_role(name: &str) -> Result<Role, ApiError> {
    roles::leash::find(name).ok_or_else(|| ApiError::bad_request(format!("unknown role '{name}'")))
}

fn non_empty_name(name: &str) -> Result<&str, ApiError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ApiError::bad_request("name must not be empty"));
    }
    Ok(name)
}

/// 409 unless `email` is free or already one of `owner`'s addresses.
async fn ensure_email_available(services: &AppServices, email: &str, owner: Option<&User>) -> Result<(), ApiError> {
    let holder = services.store.find_user_for_login(email).await?;
    match (holder, owner) {
        (Some(holder), Some(owner)) if holder.id == owner.id => Ok(()),
        (Some(_), _) => Err(ApiError::Conflict(format!("email {email} already in use"))),
        (None, _) => Ok(()),
    }
}

/// POST /users - `leash.users:create`
pub async fn create_user(
    Extension(services): Extension<Arc<AppServices>>,
    Json(req): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<UserResponse>), ApiError> {
    let role = known_role(&req.role)?;
    let new_user = NewUser::new(req.email, non_empty_name(&req.name)?, role.as_str())?;
    ensure_email_available(&services, &new_user.email, None).await?;

    let user = services.store.insert_user(new_user).await?;
    info!(user_id = %user.id, role = %user.role, "user created");
    Ok((StatusCode::CREATED, Json(UserResponse::from(&user))))
}

pub async fn get_user(Extension(TargetUser(user)): Extension<TargetUser>) -> Json<UserResponse> {
    Json(UserResponse::from(&user))
}

/// PATCH - name, pending email and (with `<prefix>:update_role`) role
pub async fn update_user(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Extension(TargetUser(user)): Extension<TargetUser>,
    Json(req): Json<UpdateUserRequest>,
) -> Result<Json<UserResponse>, ApiError> {
    let name = req.name.as_deref().map(non_empty_name).transpose()?;
    let email = req.email.as_deref().map(normalize_email).transpose()?;
    let role = match req.role.as_deref() {
        Some(role) => {
            let permission = ctx
                .prefix()
                .action("update_role")
                .map_err(|e| AuthError::infrastructure(e.to_string()))?;
            authorize(&services.policy, ctx.auth(), &permission).map_err(AuthError::from)?;
            Some(known_role(role)?)
        }
        None => None,
    };

    let mut updated = user;
    if let Some(name) = name {
        if name != updated.name {
            updated = services.store.update_user_name(updated.id, name).await?;
            info!(user_id = %updated.id, "user renamed");
        }
    }
    if let Some(email) = email {
        let pending = updated.pending_email.as_deref();
        if email.eq_ignore_ascii_case(&updated.email) {
            if pending.is_some() {
                updated = services.store.set_pending_email(updated.id, None).await?;
                info!(user_id = %updated.id, "pending email cleared");
            }
        } else if !pending.is_some_and(|p| p.eq_ignore_ascii_case(&email)) {
            ensure_email_available(&services, &email, Some(&updated)).await?;
            updated = services.store.set_pending_email(updated.id, Some(&email)).await?;
            info!(user_id = %updated.id, "pending email set");
        }
    }
    if let Some(role) = role {
        if role.as_str() != updated.role {
            let previous = updated.role.clone();
            updated = services.store.update_user_role(updated.id, role.as_str()).await?;
            info!(user_id = %updated.id, from = %previous, to = %updated.role, "user role changed");
        }
    }
    Ok(Json(UserResponse::from(&updated)))
}

/// Everything the user can do: role grants, inherited grants and overlay.
pub async fn get_permissions(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(TargetUser(user)): Extension<TargetUser>,
) -> Json<Vec<String>> {
    let permissions = services
        .policy
        .effective_permissions(&user)
        .into_iter()
        .map(String::from)
        .collect();
    Json(permissions)
}

/// Replace the user's overlay grants; role grants are untouched.
pub async fn set_permissions(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(TargetUser(user)): Extension<TargetUser>,
    Json(req): Json<SetPermissionsRequest>,
) -> Result<Json<Vec<String>>, ApiError> {
    let permissions = parse_permissions(&req.permissions)?;
    let subject = Subject::for_user(&user);
    services.policy.set_permissions(&subject, permissions);
    services.policy.save_policy().await?;
    info!(user_id = %user.id, "user grants replaced");

    let granted = services
        .policy
        .permissions_for(&subject)
        .into_iter()
        .map(String::from)
        .collect();
    Ok(Json(granted))
}

pub async fn checkin_token(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(TargetUser(user)): Extension<TargetUser>,
) -> Result<Json<CheckinTokenResponse>, ApiError> {
    let issued = services.login.issue_checkin_token(&user)?;
    Ok(Json(issued.into()))
}

pub async fn get_by_email(
    Extension(services): Extension<Arc<AppServices>>,
    Path(email): Path<String>,
) -> Result<Json<UserResponse>, ApiError> {
    let user = services
        .store
        .find_user_by_email(&email)
        .await?
        .ok_or(ApiError::NotFound("user"))?;
    Ok(Json(UserResponse::from(&user)))
}

/// Resolve a check-in token presented by its owner to someone else.
pub async fn get_by_checkin(
    Extension(services): Extension<Arc<AppServices>>,
    Path(token): Path<String>,
) -> Result<Json<UserResponse>, ApiError> {
    let user = services
        .login
        .resolve_checkin_token(&token)
        .await?
        .ok_or(ApiError::NotFound("user"))?;
    Ok(Json(UserResponse::from(&user)))
}
