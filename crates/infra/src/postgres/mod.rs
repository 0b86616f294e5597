//! Postgres-backed credential storage and policy persistence.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | Mapped to | Scenario |
//! |------------|----------------------|-----------|----------|
//! | Database (unique violation) | `23505` | `Conflict` | Duplicate email or key |
//! | Database (foreign key violation) | `23503` | `NotFound` | Owner row vanished |
//! | Database (other) | Any other | `Unavailable` | |
//! | Decode / ColumnNotFound | N/A | `Corrupt` | Schema drift |
//! | PoolClosed, Io, Tls, ... | N/A | `Unavailable` | Connection failures |

mod credentials;
mod policy;

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use leash_auth::StoreError;

pub use credentials::PostgresCredentialStore;
pub use policy::PostgresPolicyAdapter;

/// Identity and policy tables; every statement is idempotent.
pub const SCHEMA: &str = include_str!("../../migrations/0001_identity.sql");

/// Open a pool against `database_url`.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;
    info!(max_connections, "connected to postgres");
    Ok(pool)
}

/// Create missing tables and indexes.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    info!("schema up to date");
    Ok(())
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                Some("23503") => StoreError::NotFound,
                _ => StoreError::Unavailable(msg),
            }
        }
        sqlx::Error::RowNotFound => StoreError::NotFound,
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) | sqlx::Error::Decode(_) => {
            StoreError::Corrupt(format!("{} in {}", err, operation))
        }
        other => StoreError::Unavailable(format!("{} in {}", other, operation)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_idempotent() {
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| s.contains("CREATE")) {
            assert!(statement.contains("IF NOT EXISTS"), "not idempotent: {statement}");
        }
    }

    #[test]
    fn non_database_errors_map_by_kind() {
        assert_eq!(map_sqlx_error("op", sqlx::Error::RowNotFound), StoreError::NotFound);
        assert!(matches!(map_sqlx_error("op", sqlx::Error::PoolClosed), StoreError::Unavailable(_)));
        assert!(matches!(
            map_sqlx_error("op", sqlx::Error::ColumnNotFound("email".into())),
            StoreError::Corrupt(_)
        ));
    }
}
