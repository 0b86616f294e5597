use serde::{Deserialize, Serialize};

use leash_auth::{IssuedToken, Permission, PolicyEngine, Subject};
use leash_core::{ApiKey, User};

use crate::app::errors::ApiError;

// -------------------------
// Query DTOs
// -------------------------

#[derive(Debug, Default, Deserialize)]
pub struct LoginQuery {
    #[serde(rename = "return")]
    pub return_to: Option<String>,
    pub state: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogoutQuery {
    #[serde(rename = "return")]
    pub return_to: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "ListQuery::default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

impl ListQuery {
    const MAX_LIMIT: usize = 100;

    fn default_limit() -> usize {
        10
    }

    /// `items[offset..offset + limit]`, clamped.
    pub fn page<T: Clone>(&self, items: &[T]) -> Vec<T> {
        let limit = self.limit.min(Self::MAX_LIMIT);
        items.iter().skip(self.offset).take(limit).cloned().collect()
    }
}

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    pub name: String,
    pub role: String,
}

/// Absent fields are left alone. A new `email` only becomes pending; the
/// primary address changes on the next login through it.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateUserRequest {
    pub name: Option<String>,
    pub email: Option<String>,
    pub role: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SetPermissionsRequest {
    pub permissions: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    #[serde(default)]
    pub description: String,
    pub full_access: bool,
    pub permissions: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateApiKeyRequest {
    pub description: Option<String>,
    pub full_access: Option<bool>,
    pub permissions: Option<Vec<String>>,
}

/// Parse every permission string or fail on the first bad one.
pub fn parse_permissions(raw: &[String]) -> Result<Vec<Permission>, ApiError> {
    raw.iter()
        .map(|p| Permission::parse(p.as_str()).map_err(ApiError::from))
        .collect()
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: i64,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_email: Option<String>,
    pub name: String,
    pub role: String,
}

impl From<&User> for UserResponse {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.get(),
            email: user.email.clone(),
            pending_email: user.pending_email.clone(),
            name: user.name.clone(),
            role: user.role.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiKeyResponse {
    pub key: String,
    pub user_id: i64,
    pub description: String,
    pub full_access: bool,
    pub permissions: Vec<String>,
}

impl ApiKeyResponse {
    pub fn new(key: &ApiKey, policy: &PolicyEngine) -> Self {
        let permissions = policy
            .permissions_for(&Subject::for_api_key(key))
            .into_iter()
            .map(String::from)
            .collect();
        Self {
            key: key.key.clone(),
            user_id: key.user_id.get(),
            description: key.description.clone(),
            full_access: key.full_access,
            permissions,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
    pub total: usize,
}

/// `/auth/refresh` body.
#[derive(Debug, Serialize)]
pub struct SessionTokenResponse {
    pub token: String,
    pub expires_at: String,
}

impl From<IssuedToken> for SessionTokenResponse {
    fn from(issued: IssuedToken) -> Self {
        Self {
            expires_at: issued.expires_at_rfc3339(),
            token: issued.token,
        }
    }
}

/// `/users/.../checkin` body; `expires_at` is a unix timestamp.
#[derive(Debug, Serialize)]
pub struct CheckinTokenResponse {
    pub token: String,
    pub expires_at: i64,
}

impl From<IssuedToken> for CheckinTokenResponse {
    fn from(issued: IssuedToken) -> Self {
        Self {
            expires_at: issued.expires_at.timestamp(),
            token: issued.token,
        }
    }
}
