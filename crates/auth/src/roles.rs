use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Role identifier used for RBAC.
///
/// Roles are opaque names. A role that appears in no inheritance edge and
/// holds no grant is still a valid role; it simply authorizes nothing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(Cow<'static, str>);

impl Role {
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Built-in leash roles, most privileged first.
pub mod leash {
    use super::Role;

    pub const ADMIN: Role = Role::from_static("admin");
    pub const STAFF: Role = Role::from_static("staff");
    pub const VOLUNTEER: Role = Role::from_static("volunteer");
    pub const MEMBER: Role = Role::from_static("member");

    pub const ALL: [Role; 4] = [ADMIN, STAFF, VOLUNTEER, MEMBER];

    /// The built-in role called `name`, if any.
    pub fn find(name: &str) -> Option<Role> {
        ALL.into_iter().find(|role| role.as_str() == name)
    }
}

#[cfg(test)]
mod tests {
    use super::leash;

    #[test]
    fn only_the_ladder_is_built_in() {
        assert_eq!(leash::find("staff"), Some(leash::STAFF));
        assert_eq!(leash::find("Staff"), None);
        assert_eq!(leash::find("guest"), None);
    }
}
