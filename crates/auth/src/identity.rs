//! Identity resolution: raw `Authorization` header → [`AuthenticationContext`].
//!
//! "Not authenticated" is a terminal state, not an error. Any credential that
//! fails to resolve collapses into [`AuthenticationContext::LoggedOut`]; only
//! storage failures are reported as errors.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use leash_core::{ApiKey, Session, SessionId, User};

use crate::error::AuthError;
use crate::store::CredentialStore;
use crate::token::{SessionClaims, TokenCodec, audience};

/// Who is calling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationContext {
    LoggedOut,
    User { user: User, session_id: SessionId },
    ApiKey { user: User, api_key: ApiKey },
}

impl AuthenticationContext {
    pub fn is_logged_out(&self) -> bool {
        matches!(self, Self::LoggedOut)
    }

    /// The acting user, for both session and API-key contexts.
    pub fn user(&self) -> Option<&User> {
        match self {
            Self::LoggedOut => None,
            Self::User { user, .. } | Self::ApiKey { user, .. } => Some(user),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::LoggedOut => "logged_out",
            Self::User { .. } => "user",
            Self::ApiKey { .. } => "api_key",
        }
    }
}

/// Credential carried by an `Authorization` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credential<'a> {
    Session(&'a str),
    ApiKey(&'a str),
    None,
}

impl<'a> Credential<'a> {
    /// `Bearer <token>` or `API-Key <key>`; anything else is [`Credential::None`].
    pub fn from_header(value: Option<&'a str>) -> Self {
        let Some((scheme, rest)) = value.map(str::trim).and_then(|v| v.split_once(' ')) else {
            return Self::None;
        };
        let rest = rest.trim();
        if rest.is_empty() {
            return Self::None;
        }
        if scheme.eq_ignore_ascii_case("Bearer") {
            Self::Session(rest)
        } else if scheme.eq_ignore_ascii_case("API-Key") {
            Self::ApiKey(rest)
        } else {
            Self::None
        }
    }
}

/// Validity of a session row at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Active(Session),
    Expired(Session),
    Missing,
}

impl SessionState {
    /// Pure classification; never touches storage.
    pub fn classify(row: Option<Session>, now: DateTime<Utc>) -> Self {
        match row {
            None => Self::Missing,
            Some(session) if session.is_expired_at(now) => Self::Expired(session),
            Some(session) => Self::Active(session),
        }
    }
}

#[derive(Clone)]
pub struct IdentityResolver {
    store: Arc<dyn CredentialStore>,
    codec: Arc<TokenCodec>,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn CredentialStore>, codec: Arc<TokenCodec>) -> Self {
        Self { store, codec }
    }

    #[instrument(skip_all, err)]
    pub async fn resolve(&self, header: Option<&str>) -> Result<AuthenticationContext, AuthError> {
        match Credential::from_header(header) {
            Credential::Session(token) => self.resolve_session(token).await,
            Credential::ApiKey(key) => self.resolve_api_key(key).await,
            Credential::None => Ok(AuthenticationContext::LoggedOut),
        }
    }

    /// Read-only view of a session row; expired rows are reported, not removed.
    pub async fn session_state(&self, id: SessionId) -> Result<SessionState, AuthError> {
        let row = self.store.find_session(id).await?;
        Ok(SessionState::classify(row, Utc::now()))
    }

    async fn resolve_session(&self, token: &str) -> Result<AuthenticationContext, AuthError> {
        let claims = match self.codec.parse::<SessionClaims>(token, &[audience::SESSION]) {
            Ok(verified) => verified.claims,
            Err(err) => {
                debug!(error = %err, "session token rejected");
                return Ok(AuthenticationContext::LoggedOut);
            }
        };

        match self.session_state(claims.session).await? {
            SessionState::Active(_) => {}
            SessionState::Expired(session) => {
                self.store.delete_session(session.session_id).await?;
                debug!(session_id = %session.session_id, "expired session removed");
                return Ok(AuthenticationContext::LoggedOut);
            }
            SessionState::Missing => {
                debug!(session_id = %claims.session, "session revoked or unknown");
                return Ok(AuthenticationContext::LoggedOut);
            }
        }

        match self.store.find_user_by_email(&claims.email).await? {
            Some(user) => Ok(AuthenticationContext::User {
                user,
                session_id: claims.session,
            }),
            None => {
                debug!("session email no longer matches a user");
                Ok(AuthenticationContext::LoggedOut)
            }
        }
    }

    async fn resolve_api_key(&self, key: &str) -> Result<AuthenticationContext, AuthError> {
        let Some(api_key) = self.store.find_api_key(key).await? else {
            debug!(key = %leash_core::model::fingerprint(key), "unknown api key");
            return Ok(AuthenticationContext::LoggedOut);
        };
        let Some(user) = self.store.find_user(api_key.user_id).await? else {
            debug!(key = %api_key.fingerprint(), "api key owner missing");
            return Ok(AuthenticationContext::LoggedOut);
        };
        Ok(AuthenticationContext::ApiKey { user, api_key })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryCredentialStore;
    use crate::store::{ApiKeyStore, SessionStore, UserStore};
    use chrono::Duration;
    use leash_core::NewUser;

    struct Fixture {
        store: Arc<InMemoryCredentialStore>,
        codec: Arc<TokenCodec>,
        resolver: IdentityResolver,
        user: User,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryCredentialStore::new());
        let codec = Arc::new(TokenCodec::ephemeral("leash").unwrap());
        let user = store
            .insert_user(NewUser::new("ada@example.org", "Ada", "member").unwrap())
            .await
            .unwrap();
        let resolver = IdentityResolver::new(store.clone(), codec.clone());
        Fixture {
            store,
            codec,
            resolver,
            user,
        }
    }

    async fn session_token(f: &Fixture, expires_at: DateTime<Utc>) -> (SessionId, String) {
        let session = Session {
            session_id: SessionId::new(),
            user_id: f.user.id,
            expires_at,
        };
        f.store.insert_session(&session).await.unwrap();
        let claims = SessionClaims {
            email: f.user.email.clone(),
            session: session.session_id,
        };
        let token = f
            .codec
            .sign(&claims, &[audience::SERVICE, audience::SESSION], Utc::now() + Duration::days(7))
            .unwrap();
        (session.session_id, token)
    }

    #[test]
    fn header_schemes() {
        assert_eq!(Credential::from_header(Some("Bearer abc")), Credential::Session("abc"));
        assert_eq!(Credential::from_header(Some("bearer  abc ")), Credential::Session("abc"));
        assert_eq!(Credential::from_header(Some("API-Key k1")), Credential::ApiKey("k1"));
        assert_eq!(Credential::from_header(Some("Basic dXNlcg==")), Credential::None);
        assert_eq!(Credential::from_header(Some("Bearer ")), Credential::None);
        assert_eq!(Credential::from_header(Some("")), Credential::None);
        assert_eq!(Credential::from_header(None), Credential::None);
    }

    #[test]
    fn classification_is_pure() {
        let now = Utc::now();
        let session = Session {
            session_id: SessionId::new(),
            user_id: leash_core::UserId::new(1),
            expires_at: now - Duration::seconds(1),
        };
        assert_eq!(SessionState::classify(None, now), SessionState::Missing);
        assert_eq!(
            SessionState::classify(Some(session.clone()), now),
            SessionState::Expired(session.clone())
        );
        assert!(matches!(
            SessionState::classify(Some(session), now - Duration::hours(1)),
            SessionState::Active(_)
        ));
    }

    #[tokio::test]
    async fn valid_session_resolves_to_user() {
        let f = fixture().await;
        let (session_id, token) = session_token(&f, Utc::now() + Duration::hours(1)).await;
        let ctx = f.resolver.resolve(Some(&format!("Bearer {token}"))).await.unwrap();
        assert_eq!(
            ctx,
            AuthenticationContext::User {
                user: f.user.clone(),
                session_id
            }
        );
    }

    #[tokio::test]
    async fn deleted_session_row_revokes_a_valid_token() {
        let f = fixture().await;
        let (session_id, token) = session_token(&f, Utc::now() + Duration::hours(1)).await;
        f.store.delete_session(session_id).await.unwrap();
        let ctx = f.resolver.resolve(Some(&format!("Bearer {token}"))).await.unwrap();
        assert!(ctx.is_logged_out());
    }

    #[tokio::test]
    async fn expired_session_row_is_deleted_on_read() {
        let f = fixture().await;
        let (session_id, token) = session_token(&f, Utc::now() - Duration::seconds(1)).await;

        assert!(matches!(f.resolver.session_state(session_id).await.unwrap(), SessionState::Expired(_)));
        assert_eq!(f.store.session_count(), 1);

        let ctx = f.resolver.resolve(Some(&format!("Bearer {token}"))).await.unwrap();
        assert!(ctx.is_logged_out());
        assert_eq!(f.store.session_count(), 0);
    }

    #[tokio::test]
    async fn session_follows_the_email_not_the_row_owner() {
        let f = fixture().await;
        let (_, token) = session_token(&f, Utc::now() + Duration::hours(1)).await;
        f.store.set_pending_email(f.user.id, Some("ada@new.example.org")).await.unwrap();
        f.store.promote_pending_email(f.user.id).await.unwrap();

        let ctx = f.resolver.resolve(Some(&format!("Bearer {token}"))).await.unwrap();
        assert!(ctx.is_logged_out());
    }

    #[tokio::test]
    async fn garbage_tokens_and_unknown_keys_are_logged_out() {
        let f = fixture().await;
        for header in ["Bearer nope", "API-Key missing", "Token x"] {
            assert!(f.resolver.resolve(Some(header)).await.unwrap().is_logged_out());
        }
    }

    #[tokio::test]
    async fn api_key_resolves_with_owner() {
        let f = fixture().await;
        let key = ApiKey::generate(f.user.id, "ci", false);
        f.store.insert_api_key(&key).await.unwrap();
        let ctx = f.resolver.resolve(Some(&format!("API-Key {}", key.key))).await.unwrap();
        assert_eq!(
            ctx,
            AuthenticationContext::ApiKey {
                user: f.user.clone(),
                api_key: key
            }
        );
    }

    #[tokio::test]
    async fn storage_failures_are_errors_not_logged_out() {
        let f = fixture().await;
        let key = ApiKey::generate(f.user.id, "ci", false);
        f.store.insert_api_key(&key).await.unwrap();
        f.store.set_unavailable(true);
        let err = f.resolver.resolve(Some(&format!("API-Key {}", key.key))).await.unwrap_err();
        assert!(matches!(err, AuthError::Infrastructure(_)));
    }
}
