use thiserror::Error;

use crate::{Permission, PolicyError, StoreError, TokenError};

/// Failure taxonomy shared by every component of the engine.
///
/// Unauthenticated and Unauthorized both surface as 401 at the HTTP edge, so
/// a denied caller cannot tell a missing resource from a missing grant.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("unauthenticated")]
    Unauthenticated,

    #[error("unauthorized: missing permission '{0}'")]
    Unauthorized(Permission),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("infrastructure failure: {0}")]
    Infrastructure(String),
}

impl AuthError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn infrastructure(msg: impl Into<String>) -> Self {
        Self::Infrastructure(msg.into())
    }
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        Self::Infrastructure(err.to_string())
    }
}

impl From<PolicyError> for AuthError {
    fn from(err: PolicyError) -> Self {
        match err {
            PolicyError::Cycle { .. } => Self::InvalidRequest(err.to_string()),
            PolicyError::Storage(_) | PolicyError::Corrupt(_) | PolicyError::Stale => Self::Infrastructure(err.to_string()),
        }
    }
}

impl From<TokenError> for AuthError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Invalid | TokenError::Expired => Self::InvalidRequest(err.to_string()),
            TokenError::Key(_) | TokenError::Encode(_) => Self::Infrastructure(err.to_string()),
        }
    }
}
