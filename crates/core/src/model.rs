//! Identity records: users, API keys and sessions.

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{SessionId, UserId};

/// A person who can log in.
///
/// `email` is the channel of truth for session resolution. `pending_email`
/// holds an address the user is switching to; a successful login through it
/// promotes it to `email`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_email: Option<String>,
    pub name: String,
    pub role: String,
}

impl User {
    /// Whether `email` is either the primary or the pending address.
    pub fn matches_email(&self, email: &str) -> bool {
        self.email.eq_ignore_ascii_case(email)
            || self
                .pending_email
                .as_deref()
                .is_some_and(|p| p.eq_ignore_ascii_case(email))
    }
}

/// Fields required to create a user; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUser {
    pub email: String,
    pub name: String,
    pub role: String,
}

impl NewUser {
    pub fn new(email: impl Into<String>, name: impl Into<String>, role: impl Into<String>) -> DomainResult<Self> {
        let email = normalize_email(&email.into())?;
        let role = role.into();
        if role.trim().is_empty() {
            return Err(DomainError::validation("role must not be empty"));
        }
        Ok(Self {
            email,
            name: name.into(),
            role,
        })
    }
}

/// A service credential owned by exactly one user.
///
/// When `full_access` is set the key authorizes every action as its owner and
/// its own grant list is never consulted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKey {
    pub key: String,
    pub user_id: UserId,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub full_access: bool,
}

impl ApiKey {
    const KEY_BYTES: usize = 32;

    /// Mint a new key with a random 256-bit value.
    pub fn generate(user_id: UserId, description: impl Into<String>, full_access: bool) -> Self {
        let mut raw = [0u8; Self::KEY_BYTES];
        rand::thread_rng().fill_bytes(&mut raw);
        Self {
            key: hex::encode(raw),
            user_id,
            description: description.into(),
            full_access,
        }
    }

    /// Short, non-reversible label for logs.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.key)
    }
}

/// Log-safe prefix of a raw key value.
pub fn fingerprint(key: &str) -> String {
    let prefix: String = key.chars().take(6).collect();
    format!("{prefix}…")
}

/// Server-side record backing a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Trimmed `raw`, provided it looks like an address.
pub fn normalize_email(raw: &str) -> DomainResult<String> {
    let email = raw.trim();
    if !looks_like_email(email) {
        return Err(DomainError::validation(format!("invalid email address '{email}'")));
    }
    Ok(email.to_string())
}

fn looks_like_email(s: &str) -> bool {
    match s.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.'),
        None => false,
    }
}
