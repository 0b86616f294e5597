//! Credential storage contracts.
//!
//! The engine reads and writes users, API keys and sessions through these
//! traits only. Implementations live in [`crate::memory`] (tests/dev) and in
//! `leash-infra` (Postgres).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use leash_core::{ApiKey, NewUser, Session, SessionId, User, UserId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("record not found")]
    NotFound,

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_user(&self, id: UserId) -> Result<Option<User>, StoreError>;

    /// Exact match on the primary email (case-insensitive).
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;

    /// Match on the primary *or* the pending email (case-insensitive).
    async fn find_user_for_login(&self, email: &str) -> Result<Option<User>, StoreError>;

    /// Make the pending email the primary one and clear it.
    async fn promote_pending_email(&self, id: UserId) -> Result<User, StoreError>;

    async fn set_pending_email(&self, id: UserId, email: Option<&str>) -> Result<User, StoreError>;

    async fn update_user_name(&self, id: UserId, name: &str) -> Result<User, StoreError>;

    async fn update_user_role(&self, id: UserId, role: &str) -> Result<User, StoreError>;

    /// Fails with [`StoreError::Conflict`] when the email is already in use.
    async fn insert_user(&self, user: NewUser) -> Result<User, StoreError>;
}

#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    async fn find_api_key(&self, key: &str) -> Result<Option<ApiKey>, StoreError>;

    async fn list_api_keys(&self, user_id: UserId) -> Result<Vec<ApiKey>, StoreError>;

    async fn insert_api_key(&self, key: &ApiKey) -> Result<(), StoreError>;

    /// Updates description and `full_access`; the owner never changes.
    async fn update_api_key(&self, key: &ApiKey) -> Result<(), StoreError>;

    /// Idempotent; returns whether a row was removed.
    async fn delete_api_key(&self, key: &str) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert_session(&self, session: &Session) -> Result<(), StoreError>;

    async fn find_session(&self, id: SessionId) -> Result<Option<Session>, StoreError>;

    /// Returns whether a row was updated.
    async fn update_session_expiry(&self, id: SessionId, expires_at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Idempotent; returns whether a row was removed.
    async fn delete_session(&self, id: SessionId) -> Result<bool, StoreError>;
}

/// Everything the engine needs from storage.
pub trait CredentialStore: UserStore + ApiKeyStore + SessionStore {}

impl<T> CredentialStore for T where T: UserStore + ApiKeyStore + SessionStore {}
