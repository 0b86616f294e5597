//! Login/session lifecycle.
//!
//! ```text
//! begin_login ──► provider ──► complete_login ──► session token
//!                                                   │
//!                                 refresh ◄─────────┤
//!                                 logout  ◄─────────┘
//! ```
//!
//! A session token is only as good as its session row: the row is created by
//! [`LoginManager::complete_login`], extended by [`LoginManager::refresh`] and
//! removed by [`LoginManager::logout`] or lazily once expired.

use std::sync::Arc;

use chrono::{DateTime, Duration, SecondsFormat, SubsecRound, Utc};
use thiserror::Error;
use tracing::{info, instrument, warn};

use leash_core::{Session, SessionId, User};

use crate::error::AuthError;
use crate::external::{ExternalAuthError, ExternalAuthenticator};
use crate::identity::{AuthenticationContext, SessionState};
use crate::permissions::leash::LOGIN;
use crate::policy::{PolicyEngine, PolicyError};
use crate::store::{CredentialStore, StoreError};
use crate::token::{CheckinClaims, SessionClaims, StateClaims, TokenCodec, TokenError, audience};

/// Where the browser lands when the caller gives no return URL.
pub const DEFAULT_RETURN: &str = "/";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoginError {
    /// Malformed or missing state, code or token. Carries no sensitive detail.
    #[error("invalid login request: {0}")]
    InvalidRequest(String),

    /// The provider vouched for an email that no user owns.
    #[error("no account for this email")]
    NoAccount { return_to: String },

    /// A user exists but lacks the login grant.
    #[error("account is not allowed to log in")]
    LoginDenied { return_to: String },

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("infrastructure failure: {0}")]
    Infrastructure(String),
}

impl LoginError {
    fn invalid(msg: &str) -> Self {
        Self::InvalidRequest(msg.to_string())
    }
}

impl From<StoreError> for LoginError {
    fn from(err: StoreError) -> Self {
        Self::Infrastructure(err.to_string())
    }
}

impl From<PolicyError> for LoginError {
    fn from(err: PolicyError) -> Self {
        Self::Infrastructure(err.to_string())
    }
}

impl From<TokenError> for LoginError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Invalid | TokenError::Expired => Self::invalid("invalid token"),
            TokenError::Key(_) | TokenError::Encode(_) => Self::Infrastructure(err.to_string()),
        }
    }
}

impl From<ExternalAuthError> for LoginError {
    fn from(err: ExternalAuthError) -> Self {
        warn!(error = %err, "identity provider exchange failed");
        Self::invalid("code exchange failed")
    }
}

impl From<LoginError> for AuthError {
    fn from(err: LoginError) -> Self {
        match err {
            LoginError::InvalidRequest(msg) => Self::InvalidRequest(msg),
            LoginError::NoAccount { .. } | LoginError::Unauthenticated => Self::Unauthenticated,
            LoginError::LoginDenied { .. } => Self::Unauthorized(LOGIN),
            LoginError::Infrastructure(msg) => Self::Infrastructure(msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginConfig {
    pub session_ttl: Duration,
    pub state_ttl: Duration,
    pub checkin_ttl: Duration,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::days(7),
            state_ttl: Duration::minutes(5),
            checkin_ttl: Duration::minutes(2),
        }
    }
}

/// A signed token together with its expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl IssuedToken {
    pub fn expires_at_rfc3339(&self) -> String {
        self.expires_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginSuccess {
    pub user: User,
    pub session_id: SessionId,
    pub session: IssuedToken,
    /// Return URL with `token`, `expires_at` and `state` appended.
    pub redirect_to: String,
}

pub struct LoginManager {
    store: Arc<dyn CredentialStore>,
    policy: Arc<PolicyEngine>,
    codec: Arc<TokenCodec>,
    external: Arc<dyn ExternalAuthenticator>,
    config: LoginConfig,
}

impl LoginManager {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        policy: Arc<PolicyEngine>,
        codec: Arc<TokenCodec>,
        external: Arc<dyn ExternalAuthenticator>,
        config: LoginConfig,
    ) -> Self {
        Self {
            store,
            policy,
            codec,
            external,
            config,
        }
    }

    pub fn config(&self) -> &LoginConfig {
        &self.config
    }

    /// Mint a state token for the round trip and return the provider URL.
    pub fn begin_login(&self, return_to: Option<&str>, state: Option<&str>) -> Result<String, LoginError> {
        let claims = StateClaims {
            return_to: non_empty(return_to).unwrap_or(DEFAULT_RETURN).to_string(),
            state: state.unwrap_or_default().to_string(),
        };
        let expires_at = Utc::now() + self.config.state_ttl;
        let token = self
            .codec
            .sign(&claims, &[audience::SERVICE, audience::LOGIN_CALLBACK], expires_at)?;
        Ok(self.external.authorization_url(&token))
    }

    /// Provider callback: verify state, exchange the code, open a session.
    #[instrument(skip_all, err)]
    pub async fn complete_login(&self, code: Option<&str>, state_token: Option<&str>) -> Result<LoginSuccess, LoginError> {
        let state_token = non_empty(state_token).ok_or_else(|| LoginError::invalid("missing state"))?;
        let code = non_empty(code).ok_or_else(|| LoginError::invalid("missing code"))?;

        let state = self
            .codec
            .parse::<StateClaims>(state_token, &[audience::LOGIN_CALLBACK])?
            .claims;
        let email = self.external.exchange(code).await?;

        let Some(mut user) = self.store.find_user_for_login(&email).await? else {
            warn!("login attempt for an email with no account");
            return Err(LoginError::NoAccount {
                return_to: state.return_to,
            });
        };
        if !user.email.eq_ignore_ascii_case(&email) {
            user = self.store.promote_pending_email(user.id).await?;
            info!(user_id = %user.id, "pending email confirmed by login");
        }

        if !self.policy.authorize_user(&user, &LOGIN) {
            warn!(user_id = %user.id, role = %user.role, "login denied: missing login permission");
            return Err(LoginError::LoginDenied {
                return_to: state.return_to,
            });
        }

        let session_id = SessionId::new();
        let expires_at = (Utc::now() + self.config.session_ttl).trunc_subsecs(0);
        self.store
            .insert_session(&Session {
                session_id,
                user_id: user.id,
                expires_at,
            })
            .await?;
        let session = self.sign_session(&user, session_id, expires_at)?;
        info!(user_id = %user.id, %session_id, "session opened");

        let redirect_to = append_query(
            &state.return_to,
            &[
                ("token", session.token.as_str()),
                ("expires_at", session.expires_at_rfc3339().as_str()),
                ("state", state.state.as_str()),
            ],
        );
        Ok(LoginSuccess {
            user,
            session_id,
            session,
            redirect_to,
        })
    }

    /// Extend a live session; the session id does not change.
    #[instrument(skip_all, err)]
    pub async fn refresh(&self, ctx: &AuthenticationContext) -> Result<IssuedToken, LoginError> {
        let AuthenticationContext::User { user, session_id } = ctx else {
            return Err(LoginError::Unauthenticated);
        };
        let row = self.store.find_session(*session_id).await?;
        match SessionState::classify(row, Utc::now()) {
            SessionState::Active(_) => {}
            SessionState::Expired(_) => {
                self.store.delete_session(*session_id).await?;
                return Err(LoginError::Unauthenticated);
            }
            SessionState::Missing => return Err(LoginError::Unauthenticated),
        }

        let expires_at = (Utc::now() + self.config.session_ttl).trunc_subsecs(0);
        if !self.store.update_session_expiry(*session_id, expires_at).await? {
            return Err(LoginError::Unauthenticated);
        }
        let issued = self.sign_session(user, *session_id, expires_at)?;
        info!(user_id = %user.id, %session_id, "session refreshed");
        Ok(issued)
    }

    /// Delete the session named by `token`, even if it has already expired.
    ///
    /// Returns whether a row was removed.
    #[instrument(skip_all, err)]
    pub async fn logout(&self, token: &str) -> Result<bool, LoginError> {
        let claims = self
            .codec
            .parse_ignoring_expiry::<SessionClaims>(token, &[audience::SESSION])?
            .claims;
        let removed = self.store.delete_session(claims.session).await?;
        info!(session_id = %claims.session, removed, "session closed");
        Ok(removed)
    }

    pub fn issue_checkin_token(&self, user: &User) -> Result<IssuedToken, LoginError> {
        let expires_at = (Utc::now() + self.config.checkin_ttl).trunc_subsecs(0);
        let token = self.codec.sign(
            &CheckinClaims::for_user(user.id),
            &[audience::SERVICE, audience::CHECKIN],
            expires_at,
        )?;
        Ok(IssuedToken { token, expires_at })
    }

    /// User a check-in token was issued for; `None` if that user is gone.
    pub async fn resolve_checkin_token(&self, token: &str) -> Result<Option<User>, LoginError> {
        let claims = self.codec.parse::<CheckinClaims>(token, &[audience::CHECKIN])?.claims;
        Ok(self.store.find_user(claims.user_id()?).await?)
    }

    fn sign_session(&self, user: &User, session_id: SessionId, expires_at: DateTime<Utc>) -> Result<IssuedToken, LoginError> {
        let claims = SessionClaims {
            email: user.email.clone(),
            session: session_id,
        };
        let token = self
            .codec
            .sign(&claims, &[audience::SERVICE, audience::SESSION], expires_at)?;
        Ok(IssuedToken { token, expires_at })
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Append form-encoded `pairs` to `base`, keeping any query it already has.
pub fn append_query(base: &str, pairs: &[(&str, &str)]) -> String {
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in pairs {
        query.append_pair(k, v);
    }
    let query = query.finish();
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{base}{separator}{query}")
}
