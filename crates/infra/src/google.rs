//! Google OAuth2 code exchange.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument, warn};
use url::Url;

use leash_auth::{ExternalAuthError, ExternalAuthenticator};

const AUTHORIZE_URL: &str = "https://accounts.google.com/o/oauth2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v3/userinfo";
const EMAIL_SCOPE: &str = "https://www.googleapis.com/auth/userinfo.email";

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleOAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Must point at this service's `/auth/callback`.
    pub redirect_url: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    email: Option<String>,
    #[serde(default)]
    email_verified: bool,
}

/// Exchanges an authorization code for the account's verified email.
#[derive(Debug, Clone)]
pub struct GoogleAuthenticator {
    config: GoogleOAuthConfig,
    http: reqwest::Client,
}

impl GoogleAuthenticator {
    pub fn new(config: GoogleOAuthConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self { config, http })
    }

    async fn access_token(&self, code: &str) -> Result<String, ExternalAuthError> {
        let response = self
            .http
            .post(TOKEN_URL)
            .form(&[
                ("code", code),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("redirect_uri", self.config.redirect_url.as_str()),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await
            .map_err(|e| ExternalAuthError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExternalAuthError::Rejected(format!("{status}: {body}")));
        }
        if !status.is_success() {
            return Err(ExternalAuthError::Transport(format!("token endpoint returned {status}")));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ExternalAuthError::Transport(e.to_string()))?;
        Ok(token.access_token)
    }
}

#[async_trait]
impl ExternalAuthenticator for GoogleAuthenticator {
    fn authorization_url(&self, state: &str) -> String {
        let mut url = match Url::parse(AUTHORIZE_URL) {
            Ok(url) => url,
            Err(_) => return AUTHORIZE_URL.to_string(),
        };
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_url)
            .append_pair("response_type", "code")
            .append_pair("scope", EMAIL_SCOPE)
            .append_pair("access_type", "online")
            .append_pair("state", state);
        url.into()
    }

    #[instrument(skip_all, err)]
    async fn exchange(&self, code: &str) -> Result<String, ExternalAuthError> {
        let access_token = self.access_token(code).await?;

        let info: UserInfo = self
            .http
            .get(USERINFO_URL)
            .bearer_auth(access_token)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ExternalAuthError::Transport(e.to_string()))?
            .json()
            .await
            .map_err(|e| ExternalAuthError::Transport(e.to_string()))?;

        match info.email {
            Some(email) if info.email_verified && !email.is_empty() => {
                debug!("google account verified");
                Ok(email)
            }
            _ => {
                warn!("google account has no verified email");
                Err(ExternalAuthError::Unverified)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticator() -> GoogleAuthenticator {
        GoogleAuthenticator::new(GoogleOAuthConfig {
            client_id: "client-123".into(),
            client_secret: "secret".into(),
            redirect_url: "https://leash.example.org/auth/callback".into(),
        })
        .unwrap()
    }

    #[test]
    fn authorization_url_carries_client_redirect_and_state() {
        let url = Url::parse(&authenticator().authorization_url("st.at.e")).unwrap();
        assert_eq!(url.host_str(), Some("accounts.google.com"));

        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["client_id"], "client-123");
        assert_eq!(pairs["redirect_uri"], "https://leash.example.org/auth/callback");
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["scope"], EMAIL_SCOPE);
        assert_eq!(pairs["state"], "st.at.e");
    }

    #[test]
    fn client_secret_never_appears_in_the_browser_url() {
        assert!(!authenticator().authorization_url("s").contains("secret"));
    }

    #[test]
    fn userinfo_without_verification_flag_is_unverified() {
        let info: UserInfo = serde_json::from_str(r#"{"email":"ada@example.org"}"#).unwrap();
        assert!(!info.email_verified);
    }
}
