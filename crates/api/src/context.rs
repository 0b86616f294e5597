use leash_auth::{AuthenticationContext, PermissionPrefix};
use leash_core::{ApiKey, User};

/// Per-request identity plus the permission prefix of the current route.
///
/// Inserted by the authentication middleware; every nesting boundary swaps
/// in a context carrying a longer prefix. Handlers only ever read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    auth: AuthenticationContext,
    prefix: PermissionPrefix,
}

impl RequestContext {
    pub fn new(auth: AuthenticationContext) -> Self {
        Self {
            auth,
            prefix: PermissionPrefix::leash(),
        }
    }

    pub fn auth(&self) -> &AuthenticationContext {
        &self.auth
    }

    pub fn prefix(&self) -> &PermissionPrefix {
        &self.prefix
    }

    /// Same identity, different prefix.
    pub fn with_prefix(&self, prefix: PermissionPrefix) -> Self {
        Self {
            auth: self.auth.clone(),
            prefix,
        }
    }
}

/// The user a `/users/self` or `/users/:user_id` route operates on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUser(pub User);

/// The API key a `/apikeys/:key` route operates on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetApiKey(pub ApiKey);
