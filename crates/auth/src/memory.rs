//! In-memory credential store and policy adapter.
//!
//! Intended for tests/dev. Everything is lost when the process exits.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use leash_core::{ApiKey, NewUser, Session, SessionId, User, UserId};

use crate::external::{ExternalAuthError, ExternalAuthenticator};
use crate::policy::{PolicyAdapter, PolicyError, PolicySnapshot};
use crate::store::{ApiKeyStore, SessionStore, StoreError, UserStore};

#[derive(Debug, Default)]
struct Tables {
    users: BTreeMap<UserId, User>,
    last_user_id: i64,
    api_keys: HashMap<String, ApiKey>,
    sessions: HashMap<SessionId, Session>,
}

#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    tables: RwLock<Tables>,
    unavailable: AtomicBool,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn session_count(&self) -> usize {
        self.tables.read().sessions.len()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store switched off".to_string()));
        }
        Ok(())
    }
}

fn email_in_use(tables: &Tables, email: &str, except: Option<UserId>) -> bool {
    tables
        .users
        .values()
        .any(|u| Some(u.id) != except && u.matches_email(email))
}

#[async_trait]
impl UserStore for InMemoryCredentialStore {
    async fn find_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        self.check()?;
        Ok(self.tables.read().users.get(&id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        self.check()?;
        Ok(self
            .tables
            .read()
            .users
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn find_user_for_login(&self, email: &str) -> Result<Option<User>, StoreError> {
        self.check()?;
        let tables = self.tables.read();
        let primary = tables.users.values().find(|u| u.email.eq_ignore_ascii_case(email));
        Ok(primary
            .or_else(|| tables.users.values().find(|u| u.matches_email(email)))
            .cloned())
    }

    async fn promote_pending_email(&self, id: UserId) -> Result<User, StoreError> {
        self.check()?;
        let mut tables = self.tables.write();
        let user = tables.users.get_mut(&id).ok_or(StoreError::NotFound)?;
        if let Some(pending) = user.pending_email.take() {
            user.email = pending;
        }
        Ok(user.clone())
    }

    async fn set_pending_email(&self, id: UserId, email: Option<&str>) -> Result<User, StoreError> {
        self.check()?;
        let mut tables = self.tables.write();
        if let Some(email) = email {
            if email_in_use(&tables, email, Some(id)) {
                return Err(StoreError::Conflict(format!("email {email} already in use")));
            }
        }
        let user = tables.users.get_mut(&id).ok_or(StoreError::NotFound)?;
        user.pending_email = email.map(str::to_string);
        Ok(user.clone())
    }

    async fn update_user_name(&self, id: UserId, name: &str) -> Result<User, StoreError> {
        self.check()?;
        let mut tables = self.tables.write();
        let user = tables.users.get_mut(&id).ok_or(StoreError::NotFound)?;
        user.name = name.to_string();
        Ok(user.clone())
    }

    async fn update_user_role(&self, id: UserId, role: &str) -> Result<User, StoreError> {
        self.check()?;
        let mut tables = self.tables.write();
        let user = tables.users.get_mut(&id).ok_or(StoreError::NotFound)?;
        user.role = role.to_string();
        Ok(user.clone())
    }

    async fn insert_user(&self, user: NewUser) -> Result<User, StoreError> {
        self.check()?;
        let mut tables = self.tables.write();
        if email_in_use(&tables, &user.email, None) {
            return Err(StoreError::Conflict(format!("email {} already in use", user.email)));
        }
        tables.last_user_id += 1;
        let stored = User {
            id: UserId::new(tables.last_user_id),
            email: user.email,
            pending_email: None,
            name: user.name,
            role: user.role,
        };
        tables.users.insert(stored.id, stored.clone());
        Ok(stored)
    }
}

#[async_trait]
impl ApiKeyStore for InMemoryCredentialStore {
    async fn find_api_key(&self, key: &str) -> Result<Option<ApiKey>, StoreError> {
        self.check()?;
        Ok(self.tables.read().api_keys.get(key).cloned())
    }

    async fn list_api_keys(&self, user_id: UserId) -> Result<Vec<ApiKey>, StoreError> {
        self.check()?;
        let mut keys: Vec<ApiKey> = self
            .tables
            .read()
            .api_keys
            .values()
            .filter(|k| k.user_id == user_id)
            .cloned()
            .collect();
        keys.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(keys)
    }

    async fn insert_api_key(&self, key: &ApiKey) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.write();
        if !tables.users.contains_key(&key.user_id) {
            return Err(StoreError::Conflict(format!("owner {} does not exist", key.user_id)));
        }
        if tables.api_keys.contains_key(&key.key) {
            return Err(StoreError::Conflict("duplicate api key".to_string()));
        }
        tables.api_keys.insert(key.key.clone(), key.clone());
        Ok(())
    }

    async fn update_api_key(&self, key: &ApiKey) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.write();
        let stored = tables.api_keys.get_mut(&key.key).ok_or(StoreError::NotFound)?;
        stored.description = key.description.clone();
        stored.full_access = key.full_access;
        Ok(())
    }

    async fn delete_api_key(&self, key: &str) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self.tables.write().api_keys.remove(key).is_some())
    }
}

#[async_trait]
impl SessionStore for InMemoryCredentialStore {
    async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.write();
        if tables.sessions.contains_key(&session.session_id) {
            return Err(StoreError::Conflict("duplicate session id".to_string()));
        }
        tables.sessions.insert(session.session_id, session.clone());
        Ok(())
    }

    async fn find_session(&self, id: SessionId) -> Result<Option<Session>, StoreError> {
        self.check()?;
        Ok(self.tables.read().sessions.get(&id).cloned())
    }

    async fn update_session_expiry(&self, id: SessionId, expires_at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.check()?;
        Ok(match self.tables.write().sessions.get_mut(&id) {
            Some(session) => {
                session.expires_at = expires_at;
                true
            }
            None => false,
        })
    }

    async fn delete_session(&self, id: SessionId) -> Result<bool, StoreError> {
        self.check()?;
        Ok(self.tables.write().sessions.remove(&id).is_some())
    }
}

/// Policy adapter holding the last saved snapshot in memory.
#[derive(Debug, Default)]
pub struct InMemoryPolicyAdapter {
    stored: RwLock<PolicySnapshot>,
    saves: AtomicUsize,
}

impl InMemoryPolicyAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of snapshots actually written.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn stored_revision(&self) -> u64 {
        self.stored.read().revision
    }
}

#[async_trait]
impl PolicyAdapter for InMemoryPolicyAdapter {
    async fn load_policy(&self) -> Result<PolicySnapshot, PolicyError> {
        Ok(self.stored.read().clone())
    }

    async fn save_policy(&self, snapshot: &PolicySnapshot, expected_revision: u64) -> Result<bool, PolicyError> {
        let mut stored = self.stored.write();
        if stored.revision != expected_revision {
            return Ok(false);
        }
        *stored = snapshot.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

/// Identity provider that knows a fixed table of code → email.
#[derive(Debug)]
pub struct StaticAuthenticator {
    authorize_url: String,
    codes: RwLock<HashMap<String, String>>,
}

impl StaticAuthenticator {
    pub fn new(authorize_url: impl Into<String>) -> Self {
        Self {
            authorize_url: authorize_url.into(),
            codes: RwLock::new(HashMap::new()),
        }
    }

    /// Make `code` exchange for `email`.
    pub fn register(&self, code: impl Into<String>, email: impl Into<String>) {
        self.codes.write().insert(code.into(), email.into());
    }
}

#[async_trait]
impl ExternalAuthenticator for StaticAuthenticator {
    fn authorization_url(&self, state: &str) -> String {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("state", state)
            .finish();
        format!("{}?{query}", self.authorize_url)
    }

    async fn exchange(&self, code: &str) -> Result<String, ExternalAuthError> {
        self.codes
            .read()
            .get(code)
            .cloned()
            .ok_or_else(|| ExternalAuthError::Rejected("unknown code".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn seeded() -> (InMemoryCredentialStore, User) {
        let store = InMemoryCredentialStore::new();
        let user = store
            .insert_user(NewUser::new("ada@example.org", "Ada", "member").unwrap())
            .await
            .unwrap();
        (store, user)
    }

    #[tokio::test]
    async fn duplicate_emails_conflict() {
        let (store, _) = seeded().await;
        let err = store
            .insert_user(NewUser::new("ADA@example.org", "Other", "member").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn login_lookup_falls_back_to_pending_email() {
        let (store, user) = seeded().await;
        store.set_pending_email(user.id, Some("ada@new.example.org")).await.unwrap();

        assert!(store.find_user_by_email("ada@new.example.org").await.unwrap().is_none());
        let found = store.find_user_for_login("ada@new.example.org").await.unwrap().unwrap();
        assert_eq!(found.id, user.id);

        let promoted = store.promote_pending_email(user.id).await.unwrap();
        assert_eq!(promoted.email, "ada@new.example.org");
        assert_eq!(promoted.pending_email, None);
    }

    #[tokio::test]
    async fn pending_email_cannot_take_another_users_address() {
        let (store, ada) = seeded().await;
        let bob = store
            .insert_user(NewUser::new("bob@example.org", "Bob", "member").unwrap())
            .await
            .unwrap();

        let err = store.set_pending_email(bob.id, Some("Ada@example.org")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let promoted = store.update_user_role(ada.id, "staff").await.unwrap();
        assert_eq!(promoted.role, "staff");
        assert!(matches!(
            store.update_user_role(UserId::new(99), "staff").await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn session_deletes_are_idempotent() {
        let (store, user) = seeded().await;
        let session = Session {
            session_id: SessionId::new(),
            user_id: user.id,
            expires_at: Utc::now() + Duration::hours(1),
        };
        store.insert_session(&session).await.unwrap();
        assert!(store.delete_session(session.session_id).await.unwrap());
        assert!(!store.delete_session(session.session_id).await.unwrap());
        assert!(!store.update_session_expiry(session.session_id, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn api_keys_require_an_existing_owner() {
        let (store, user) = seeded().await;
        let orphan = ApiKey::generate(UserId::new(999), "x", false);
        assert!(matches!(store.insert_api_key(&orphan).await, Err(StoreError::Conflict(_))));

        let mut key = ApiKey::generate(user.id, "ci", false);
        store.insert_api_key(&key).await.unwrap();
        key.full_access = true;
        store.update_api_key(&key).await.unwrap();
        assert!(store.find_api_key(&key.key).await.unwrap().unwrap().full_access);
        assert_eq!(store.list_api_keys(user.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unavailable_store_reports_errors() {
        let (store, user) = seeded().await;
        store.set_unavailable(true);
        assert!(matches!(store.find_user(user.id).await, Err(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn adapter_writes_only_over_the_expected_revision() {
        let adapter = InMemoryPolicyAdapter::new();
        let first = PolicySnapshot {
            revision: 5,
            ..Default::default()
        };
        let racing = PolicySnapshot {
            revision: 9,
            ..Default::default()
        };
        assert!(adapter.save_policy(&first, 0).await.unwrap());
        assert!(!adapter.save_policy(&racing, 0).await.unwrap());
        assert_eq!(adapter.stored_revision(), 5);
        assert!(adapter.save_policy(&racing, 5).await.unwrap());
        assert_eq!(adapter.stored_revision(), 9);
    }
}
