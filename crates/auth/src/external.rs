use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExternalAuthError {
    #[error("identity provider rejected the authorization code: {0}")]
    Rejected(String),

    #[error("identity provider did not return a verified email")]
    Unverified,

    #[error("identity provider unreachable: {0}")]
    Transport(String),
}

/// External identity provider (OAuth2-style code exchange).
///
/// Given the code from a provider redirect, returns a verified email address.
#[async_trait]
pub trait ExternalAuthenticator: Send + Sync {
    /// Provider URL the browser is sent to; `state` is echoed back verbatim.
    fn authorization_url(&self, state: &str) -> String;

    async fn exchange(&self, code: &str) -> Result<String, ExternalAuthError>;
}
