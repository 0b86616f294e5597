//! Built-in leash policy: the role ladder and the grants each rung adds.

use tracing::info;

use crate::permissions::Permission;
use crate::policy::{PolicyEngine, PolicyError};
use crate::roles::leash::{ADMIN, MEMBER, STAFF, VOLUNTEER};
use crate::{Role, Subject};

const MEMBER_GRANTS: &[&str] = &[
    "leash:login",
    "leash.users:target_self",
    "leash.users.self:get",
    "leash.users.self:update",
    "leash.users.self:permissions",
    "leash.users.self:checkin",
    "leash.users.self.apikeys:list",
    "leash.users.self.apikeys:create",
    "leash.users.self.apikeys:target",
    "leash.users.self.apikeys:get",
    "leash.users.self.apikeys:update",
    "leash.users.self.apikeys:delete",
];

const VOLUNTEER_GRANTS: &[&str] = &[
    "leash.users:target_others",
    "leash.users.others:get",
    "leash.users.others:permissions",
    "leash.users.self.trainings:create",
    "leash.users.get:email",
];

const STAFF_GRANTS: &[&str] = &[
    "leash.users.others:update",
    "leash.users.others:checkin",
    "leash.users.others.trainings:create",
];

const ADMIN_GRANTS: &[&str] = &[
    "leash.users:create",
    "leash.users.self:set_permissions",
    "leash.users.others:set_permissions",
    "leash.users.self:update_role",
    "leash.users.others:update_role",
    "leash.users.self.apikeys:full_access",
    "leash.users.get:checkin",
    "leash.users.others.apikeys:list",
    "leash.users.others.apikeys:create",
    "leash.users.others.apikeys:target",
    "leash.users.others.apikeys:get",
    "leash.users.others.apikeys:update",
    "leash.users.others.apikeys:delete",
    "leash.users.others.apikeys:full_access",
    "leash.apikeys:target",
    "leash.apikeys:get",
    "leash.apikeys:update",
    "leash.apikeys:delete",
    "leash.apikeys:full_access",
];

/// Each role with the grants it holds directly (not counting inheritance).
pub fn default_grants() -> Vec<(Role, Vec<Permission>)> {
    [
        (MEMBER, MEMBER_GRANTS),
        (VOLUNTEER, VOLUNTEER_GRANTS),
        (STAFF, STAFF_GRANTS),
        (ADMIN, ADMIN_GRANTS),
    ]
    .into_iter()
    .map(|(role, grants)| (role, grants.iter().copied().map(Permission::from_static).collect()))
    .collect()
}

/// `admin ⟸ staff ⟸ volunteer ⟸ member`.
pub fn default_edges() -> Vec<(Role, Role)> {
    vec![(ADMIN, STAFF), (STAFF, VOLUNTEER), (VOLUNTEER, MEMBER)]
}

/// Install the built-in policy, replacing whatever the built-in roles held.
///
/// Idempotent. Call [`PolicyEngine::save_policy`] afterwards to persist.
pub fn seed_default_policy(policy: &PolicyEngine) -> Result<(), PolicyError> {
    for (parent, child) in default_edges() {
        policy.add_inheritance(&parent, &child)?;
    }
    for (role, grants) in default_grants() {
        policy.set_permissions(&Subject::from(role), grants);
    }
    info!(revision = policy.revision(), "default policy seeded");
    Ok(())
}
