use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::identity::AuthenticationContext;
use crate::policy::PolicyEngine;
use crate::{AuthError, Permission, Subject};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("unauthenticated")]
    Unauthenticated,

    #[error("unauthorized: missing permission '{0}'")]
    Unauthorized(Permission),
}

impl From<AuthzError> for AuthError {
    fn from(err: AuthzError) -> Self {
        match err {
            AuthzError::Unauthenticated => Self::Unauthenticated,
            AuthzError::Unauthorized(p) => Self::Unauthorized(p),
        }
    }
}

/// Decide whether `ctx` may perform `permission`.
///
/// - No IO
/// - No side effects
/// - API-key contexts are judged on the key alone, never on the owner's grants
pub fn authorize(
    policy: &PolicyEngine,
    ctx: &AuthenticationContext,
    permission: &Permission,
) -> Result<(), AuthzError> {
    let allowed = match ctx {
        AuthenticationContext::LoggedOut => return Err(AuthzError::Unauthenticated),
        AuthenticationContext::User { user, .. } => policy.authorize_user(user, permission),
        AuthenticationContext::ApiKey { api_key, .. } => policy.authorize_api_key(api_key, permission),
    };
    debug!(%permission, context = ctx.kind(), allowed, "authorization decision");
    if allowed {
        Ok(())
    } else {
        Err(AuthzError::Unauthorized(permission.clone()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Authorization Explanation (Audit Trail)
// ─────────────────────────────────────────────────────────────────────────────

/// Why a decision came out the way it did.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationExplanation {
    pub required_permission: String,
    pub granted: bool,
    pub reason: String,
    /// Rendered (redacted) subject that holds the grant, if any.
    pub granted_by: Option<String>,
}

pub fn explain_authorization(
    policy: &PolicyEngine,
    ctx: &AuthenticationContext,
    permission: &Permission,
) -> AuthorizationExplanation {
    let required_permission = permission.to_string();
    match ctx {
        AuthenticationContext::LoggedOut => AuthorizationExplanation {
            required_permission,
            granted: false,
            reason: "no credential presented".to_string(),
            granted_by: None,
        },
        AuthenticationContext::User { user, .. } => match policy.explain_user(user, permission) {
            Some(subject) => AuthorizationExplanation {
                required_permission,
                granted: true,
                reason: format!("granted through {}", subject.redacted()),
                granted_by: Some(subject.redacted()),
            },
            None => AuthorizationExplanation {
                required_permission,
                granted: false,
                reason: format!(
                    "neither role '{}' (with inherited roles) nor user:{} holds the permission",
                    user.role, user.id
                ),
                granted_by: None,
            },
        },
        AuthenticationContext::ApiKey { api_key, .. } => {
            let subject = Subject::for_api_key(api_key);
            if api_key.full_access {
                AuthorizationExplanation {
                    required_permission,
                    granted: true,
                    reason: "api key has full access".to_string(),
                    granted_by: Some(subject.redacted()),
                }
            } else if policy.has_permission(&subject, permission) {
                AuthorizationExplanation {
                    required_permission,
                    granted: true,
                    reason: format!("granted directly to {}", subject.redacted()),
                    granted_by: Some(subject.redacted()),
                }
            } else {
                AuthorizationExplanation {
                    required_permission,
                    granted: false,
                    reason: format!(
                        "{} lacks the permission; owner grants are not consulted for api keys",
                        subject.redacted()
                    ),
                    granted_by: None,
                }
            }
        }
    }
}
