use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use leash_auth::{ApiKeyStore, SessionStore, StoreError, UserStore};
use leash_core::{ApiKey, NewUser, Session, SessionId, User, UserId};

use super::map_sqlx_error;

const USER_COLUMNS: &str = "id, email, pending_email, name, role";

struct UserRow(User);

impl<'r> FromRow<'r, PgRow> for UserRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self(User {
            id: UserId::new(row.try_get("id")?),
            email: row.try_get("email")?,
            pending_email: row.try_get("pending_email")?,
            name: row.try_get("name")?,
            role: row.try_get("role")?,
        }))
    }
}

struct ApiKeyRow(ApiKey);

impl<'r> FromRow<'r, PgRow> for ApiKeyRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self(ApiKey {
            key: row.try_get("key")?,
            user_id: UserId::new(row.try_get("user_id")?),
            description: row.try_get("description")?,
            full_access: row.try_get("full_access")?,
        }))
    }
}

struct SessionRow(Session);

impl<'r> FromRow<'r, PgRow> for SessionRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let session_id: Uuid = row.try_get("session_id")?;
        Ok(Self(Session {
            session_id: SessionId::from_uuid(session_id),
            user_id: UserId::new(row.try_get("user_id")?),
            expires_at: row.try_get("expires_at")?,
        }))
    }
}

fn decode<'r, T: FromRow<'r, PgRow>>(operation: &str, row: &'r PgRow) -> Result<T, StoreError> {
    T::from_row(row).map_err(|e| map_sqlx_error(operation, e))
}

/// Users, API keys and sessions in Postgres.
///
/// Email comparisons are case-insensitive and backed by `lower(email)`
/// unique indexes, so a duplicate insert surfaces as `Conflict`.
#[derive(Debug, Clone)]
pub struct PostgresCredentialStore {
    pool: Arc<PgPool>,
}

impl PostgresCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    async fn fetch_user(&self, operation: &str, sql: &str, id: UserId) -> Result<User, StoreError> {
        let row = sqlx::query(sql)
            .bind(id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?
            .ok_or(StoreError::NotFound)?;
        decode::<UserRow>(operation, &row).map(|r| r.0)
    }
}

#[async_trait]
impl UserStore for PostgresCredentialStore {
    #[instrument(skip(self), err)]
    async fn find_user(&self, id: UserId) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_user", e))?;
        row.map(|r| decode::<UserRow>("find_user", &r).map(|u| u.0)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE lower(email) = lower($1)"
        ))
        .bind(email)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_user_by_email", e))?;
        row.map(|r| decode::<UserRow>("find_user_by_email", &r).map(|u| u.0)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn find_user_for_login(&self, email: &str) -> Result<Option<User>, StoreError> {
        // A primary-email match wins over someone else's pending address.
        let row = sqlx::query(&format!(
            r#"
            SELECT {USER_COLUMNS}
            FROM users
            WHERE lower(email) = lower($1) OR lower(pending_email) = lower($1)
            ORDER BY (lower(email) = lower($1)) DESC, id
            LIMIT 1
            "#
        ))
        .bind(email)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_user_for_login", e))?;
        row.map(|r| decode::<UserRow>("find_user_for_login", &r).map(|u| u.0)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn promote_pending_email(&self, id: UserId) -> Result<User, StoreError> {
        self.fetch_user(
            "promote_pending_email",
            &format!(
                r#"
                UPDATE users
                SET email = COALESCE(pending_email, email), pending_email = NULL
                WHERE id = $1
                RETURNING {USER_COLUMNS}
                "#
            ),
            id,
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn set_pending_email(&self, id: UserId, email: Option<&str>) -> Result<User, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE users SET pending_email = $2 WHERE id = $1 RETURNING {USER_COLUMNS}"
        ))
        .bind(id.get())
        .bind(email)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_pending_email", e))?
        .ok_or(StoreError::NotFound)?;
        decode::<UserRow>("set_pending_email", &row).map(|u| u.0)
    }

    #[instrument(skip(self), err)]
    async fn update_user_name(&self, id: UserId, name: &str) -> Result<User, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE users SET name = $2 WHERE id = $1 RETURNING {USER_COLUMNS}"
        ))
        .bind(id.get())
        .bind(name)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_user_name", e))?
        .ok_or(StoreError::NotFound)?;
        decode::<UserRow>("update_user_name", &row).map(|u| u.0)
    }

    #[instrument(skip(self), err)]
    async fn update_user_role(&self, id: UserId, role: &str) -> Result<User, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE users SET role = $2 WHERE id = $1 RETURNING {USER_COLUMNS}"
        ))
        .bind(id.get())
        .bind(role)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_user_role", e))?
        .ok_or(StoreError::NotFound)?;
        decode::<UserRow>("update_user_role", &row).map(|u| u.0)
    }

    #[instrument(skip(self, user), fields(email = %user.email), err)]
    async fn insert_user(&self, user: NewUser) -> Result<User, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO users (email, name, role) VALUES ($1, $2, $3) RETURNING {USER_COLUMNS}"
        ))
        .bind(&user.email)
        .bind(&user.name)
        .bind(&user.role)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_user", e))?;
        decode::<UserRow>("insert_user", &row).map(|u| u.0)
    }
}

#[async_trait]
impl ApiKeyStore for PostgresCredentialStore {
    #[instrument(skip_all, err)]
    async fn find_api_key(&self, key: &str) -> Result<Option<ApiKey>, StoreError> {
        let row = sqlx::query(
            "SELECT key, user_id, description, full_access FROM api_keys WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_api_key", e))?;
        row.map(|r| decode::<ApiKeyRow>("find_api_key", &r).map(|k| k.0)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_api_keys(&self, user_id: UserId) -> Result<Vec<ApiKey>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT key, user_id, description, full_access
            FROM api_keys
            WHERE user_id = $1
            ORDER BY created_at, key
            "#,
        )
        .bind(user_id.get())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_api_keys", e))?;
        rows.iter()
            .map(|r| decode::<ApiKeyRow>("list_api_keys", r).map(|k| k.0))
            .collect()
    }

    #[instrument(skip_all, fields(key = %key.fingerprint(), user_id = %key.user_id), err)]
    async fn insert_api_key(&self, key: &ApiKey) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO api_keys (key, user_id, description, full_access) VALUES ($1, $2, $3, $4)",
        )
        .bind(&key.key)
        .bind(key.user_id.get())
        .bind(&key.description)
        .bind(key.full_access)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_api_key", e))?;
        Ok(())
    }

    #[instrument(skip_all, fields(key = %key.fingerprint()), err)]
    async fn update_api_key(&self, key: &ApiKey) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE api_keys SET description = $2, full_access = $3 WHERE key = $1",
        )
        .bind(&key.key)
        .bind(&key.description)
        .bind(key.full_access)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_api_key", e))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    #[instrument(skip_all, err)]
    async fn delete_api_key(&self, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM api_keys WHERE key = $1")
            .bind(key)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_api_key", e))?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl SessionStore for PostgresCredentialStore {
    #[instrument(skip_all, fields(user_id = %session.user_id), err)]
    async fn insert_session(&self, session: &Session) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO sessions (session_id, user_id, expires_at) VALUES ($1, $2, $3)")
            .bind(*session.session_id.as_uuid())
            .bind(session.user_id.get())
            .bind(session.expires_at)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert_session", e))?;
        Ok(())
    }

    #[instrument(skip_all, err)]
    async fn find_session(&self, id: SessionId) -> Result<Option<Session>, StoreError> {
        let row = sqlx::query("SELECT session_id, user_id, expires_at FROM sessions WHERE session_id = $1")
            .bind(*id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_session", e))?;
        row.map(|r| decode::<SessionRow>("find_session", &r).map(|s| s.0)).transpose()
    }

    #[instrument(skip_all, err)]
    async fn update_session_expiry(&self, id: SessionId, expires_at: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE sessions SET expires_at = $2 WHERE session_id = $1")
            .bind(*id.as_uuid())
            .bind(expires_at)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_session_expiry", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip_all, err)]
    async fn delete_session(&self, id: SessionId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM sessions WHERE session_id = $1")
            .bind(*id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_session", e))?;
        Ok(result.rows_affected() > 0)
    }
}
