use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use leash_auth::{Grant, Permission, PolicyAdapter, PolicyError, PolicySnapshot, Role, RoleEdge, Subject};

use super::map_sqlx_error;

fn storage(operation: &str, err: sqlx::Error) -> PolicyError {
    PolicyError::Storage(map_sqlx_error(operation, err).to_string())
}

fn to_db_revision(revision: u64) -> Result<i64, PolicyError> {
    i64::try_from(revision).map_err(|_| PolicyError::Storage(format!("revision {revision} out of range")))
}

/// Policy snapshot persistence.
///
/// A save replaces both relations inside one transaction. The single
/// `policy_revision` row is compare-and-swapped first; that row lock also
/// serializes concurrent savers.
#[derive(Debug, Clone)]
pub struct PostgresPolicyAdapter {
    pool: Arc<PgPool>,
}

impl PostgresPolicyAdapter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

#[async_trait]
impl PolicyAdapter for PostgresPolicyAdapter {
    #[instrument(skip(self), err)]
    async fn load_policy(&self) -> Result<PolicySnapshot, PolicyError> {
        let revision: i64 = sqlx::query("SELECT revision FROM policy_revision WHERE id = 1")
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| storage("load_policy", e))?
            .map(|row| row.try_get("revision"))
            .transpose()
            .map_err(|e| storage("load_policy", e))?
            .unwrap_or(0);

        let grant_rows = sqlx::query("SELECT subject, permission FROM policy_grants ORDER BY subject, permission")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| storage("load_policy", e))?;
        let mut grants = Vec::with_capacity(grant_rows.len());
        for row in grant_rows {
            let subject: String = row.try_get("subject").map_err(|e| storage("load_policy", e))?;
            let permission: String = row.try_get("permission").map_err(|e| storage("load_policy", e))?;
            grants.push(Grant {
                subject: subject
                    .parse::<Subject>()
                    .map_err(|e| PolicyError::Corrupt(format!("subject '{subject}': {e}")))?,
                permission: Permission::parse(permission.as_str())
                    .map_err(|e| PolicyError::Corrupt(format!("permission '{permission}': {e}")))?,
            });
        }

        let edge_rows = sqlx::query("SELECT parent, child FROM policy_edges ORDER BY parent, child")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| storage("load_policy", e))?;
        let mut edges = Vec::with_capacity(edge_rows.len());
        for row in edge_rows {
            let parent: String = row.try_get("parent").map_err(|e| storage("load_policy", e))?;
            let child: String = row.try_get("child").map_err(|e| storage("load_policy", e))?;
            edges.push(RoleEdge {
                parent: Role::new(parent),
                child: Role::new(child),
            });
        }

        debug!(revision, grants = grants.len(), edges = edges.len(), "policy loaded");
        Ok(PolicySnapshot {
            revision: u64::try_from(revision)
                .map_err(|_| PolicyError::Corrupt(format!("negative policy revision {revision}")))?,
            grants,
            edges,
        })
    }

    #[instrument(skip_all, fields(revision = snapshot.revision), err)]
    async fn save_policy(&self, snapshot: &PolicySnapshot, expected_revision: u64) -> Result<bool, PolicyError> {
        let revision = to_db_revision(snapshot.revision)?;
        let expected = to_db_revision(expected_revision)?;

        let mut tx = self.pool.begin().await.map_err(|e| storage("save_policy", e))?;

        // The schema seeds the row at revision 0.
        let accepted = sqlx::query(
            "UPDATE policy_revision SET revision = $1 WHERE id = 1 AND revision = $2 RETURNING revision",
        )
        .bind(revision)
        .bind(expected)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| storage("save_policy", e))?
        .is_some();

        if !accepted {
            tx.rollback().await.map_err(|e| storage("save_policy", e))?;
            debug!(expected, "stored policy revision moved, skipping save");
            return Ok(false);
        }

        sqlx::query("DELETE FROM policy_grants")
            .execute(&mut *tx)
            .await
            .map_err(|e| storage("save_policy", e))?;
        sqlx::query("DELETE FROM policy_edges")
            .execute(&mut *tx)
            .await
            .map_err(|e| storage("save_policy", e))?;

        let (subjects, permissions): (Vec<String>, Vec<String>) = snapshot
            .grants
            .iter()
            .map(|g| (g.subject.to_string(), g.permission.as_str().to_string()))
            .unzip();
        sqlx::query(
            "INSERT INTO policy_grants (subject, permission) SELECT * FROM UNNEST($1::text[], $2::text[])",
        )
        .bind(&subjects)
        .bind(&permissions)
        .execute(&mut *tx)
        .await
        .map_err(|e| storage("save_policy", e))?;

        let (parents, children): (Vec<String>, Vec<String>) = snapshot
            .edges
            .iter()
            .map(|e| (e.parent.as_str().to_string(), e.child.as_str().to_string()))
            .unzip();
        sqlx::query("INSERT INTO policy_edges (parent, child) SELECT * FROM UNNEST($1::text[], $2::text[])")
            .bind(&parents)
            .bind(&children)
            .execute(&mut *tx)
            .await
            .map_err(|e| storage("save_policy", e))?;

        tx.commit().await.map_err(|e| storage("save_policy", e))?;
        debug!(grants = subjects.len(), edges = parents.len(), "policy saved");
        Ok(true)
    }
}
