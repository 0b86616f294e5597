//! `/auth/*`: the browser-facing login handshake and session endpoints.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Query},
    http::{StatusCode, header},
    middleware::{from_fn, from_fn_with_state},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use url::form_urlencoded;

use leash_auth::{AuthError, AuthenticationContext, LoginError};

use crate::app::dto::{CallbackQuery, LoginQuery, LogoutQuery, SessionTokenResponse};
use crate::app::errors::ApiError;
use crate::app::services::AppServices;
use crate::context::RequestContext;
use crate::middleware::{authenticate, reject_api_keys};

pub fn router(services: Arc<AppServices>) -> Router {
    Router::new()
        .route("/login", get(login))
        .route("/callback", get(callback))
        .route("/validate", get(validate))
        .route("/refresh", get(refresh))
        .route("/logout", get(logout))
        .layer(from_fn(reject_api_keys))
        .layer(from_fn_with_state(services, authenticate))
}

fn found(location: String) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

/// GET /auth/login?return=&state= - off to the identity provider
pub async fn login(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<LoginQuery>,
) -> Result<Response, ApiError> {
    let url = services
        .login
        .begin_login(query.return_to.as_deref(), query.state.as_deref())?;
    Ok(found(url))
}

/// GET /auth/callback?code=&state= - back from the identity provider
pub async fn callback(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<CallbackQuery>,
) -> Result<Response, ApiError> {
    match services
        .login
        .complete_login(query.code.as_deref(), query.state.as_deref())
        .await
    {
        Ok(success) => Ok(found(success.redirect_to)),
        Err(LoginError::NoAccount { return_to }) => Ok(login_failed_page(
            "There is no account for this email address.",
            &return_to,
        )),
        Err(LoginError::LoginDenied { return_to }) => Ok(login_failed_page(
            "This account is not allowed to log in.",
            &return_to,
        )),
        Err(err) => Err(err.into()),
    }
}

fn login_failed_page(reason: &str, return_to: &str) -> Response {
    let retry: String = form_urlencoded::byte_serialize(return_to.as_bytes()).collect();
    let body = format!(
        "<!DOCTYPE html>\n<html>\n<head><title>Login Failed</title></head>\n<body>\n\
         <h1>Login Failed</h1>\n<p>{reason}</p>\n\
         <p><a href=\"/auth/login?return={retry}\">Retry Login</a></p>\n</body>\n</html>\n"
    );
    (StatusCode::UNAUTHORIZED, Html(body)).into_response()
}

fn require_user(ctx: &RequestContext) -> Result<(), ApiError> {
    match ctx.auth() {
        AuthenticationContext::User { .. } => Ok(()),
        _ => Err(AuthError::Unauthenticated.into()),
    }
}

/// GET /auth/validate
pub async fn validate(Extension(ctx): Extension<RequestContext>) -> Result<&'static str, ApiError> {
    require_user(&ctx)?;
    Ok("Authorized")
}

/// GET /auth/refresh - same session, later expiry
pub async fn refresh(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
) -> Result<Json<SessionTokenResponse>, ApiError> {
    require_user(&ctx)?;
    let issued = services.login.refresh(ctx.auth()).await?;
    Ok(Json(issued.into()))
}

/// GET /auth/logout?token=&return=
pub async fn logout(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<LogoutQuery>,
) -> Result<Response, ApiError> {
    let token = query
        .token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing token"))?;
    services.login.logout(token).await?;

    let return_to = query
        .return_to
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| leash_auth::login::DEFAULT_RETURN.to_string());
    Ok(found(return_to))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn failed_login_page_links_back_with_an_encoded_return() {
        let response = login_failed_page("nope", "https://app.test/x?a=1&b=2");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("Retry Login"));
        assert!(body.contains("/auth/login?return=https%3A%2F%2Fapp.test%2Fx%3Fa%3D1%26b%3D2"));
    }

    #[test]
    fn redirects_are_302_with_location() {
        let response = found("/home".to_string());
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[header::LOCATION], "/home");
    }
}
