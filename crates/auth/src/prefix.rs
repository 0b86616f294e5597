//! Permission-prefix composition.
//!
//! A [`PermissionPrefix`] is an immutable value. Each route-nesting boundary
//! derives a new prefix with [`PermissionPrefix::nest`]; the terminal guard
//! turns it into a [`Permission`] with [`PermissionPrefix::action`]. The same
//! logical resource path therefore always yields the same permission string,
//! and sibling branches (`self` vs `others`) can never collide.

use crate::permissions::{PermissionError, is_segment_char};
use crate::Permission;

/// Root namespace of every leash permission.
pub const ROOT: &str = "leash";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PermissionPrefix(String);

impl PermissionPrefix {
    /// Start a prefix at `namespace`.
    pub fn root(namespace: &str) -> Result<Self, PermissionError> {
        check_segment(namespace, namespace)?;
        Ok(Self(namespace.to_string()))
    }

    /// The `leash` root.
    pub fn leash() -> Self {
        Self(ROOT.to_string())
    }

    /// Derive `self.segment`; `self` is left untouched.
    pub fn nest(&self, segment: &str) -> Result<Self, PermissionError> {
        let joined = format!("{}.{segment}", self.0);
        check_segment(segment, &joined)?;
        Ok(Self(joined))
    }

    /// Terminate the prefix with `:action`.
    pub fn action(&self, action: &str) -> Result<Permission, PermissionError> {
        Permission::parse(format!("{}:{action}", self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.split('.').count()
    }
}

impl Default for PermissionPrefix {
    fn default() -> Self {
        Self::leash()
    }
}

impl core::fmt::Display for PermissionPrefix {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

fn check_segment(segment: &str, whole: &str) -> Result<(), PermissionError> {
    if segment.is_empty() {
        return Err(PermissionError::EmptySegment(whole.to_string()));
    }
    match segment.chars().find(|c| !is_segment_char(*c)) {
        Some(c) => Err(PermissionError::InvalidCharacter(whole.to_string(), c)),
        None => Ok(()),
    }
}
