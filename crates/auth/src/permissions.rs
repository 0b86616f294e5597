use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Permission identifier.
///
/// A permission is a hierarchical string `domain.resource[.sub...]:action`.
/// Dot-separated segments form the namespace path and a single colon separates
/// the path from the action verb. Matching is exact string equality; there is
/// no wildcard or glob expansion.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Permission(Cow<'static, str>);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PermissionError {
    #[error("permission '{0}' must contain exactly one ':' separating path and action")]
    MissingAction(String),

    #[error("permission '{0}' has an empty path segment")]
    EmptySegment(String),

    #[error("permission '{0}' contains invalid character {1:?}")]
    InvalidCharacter(String, char),
}

impl Permission {
    /// Build a permission from a compile-time literal.
    ///
    /// The literal is not validated; keep it to `path:action` form.
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    /// Parse and validate a permission string.
    pub fn parse(name: impl Into<String>) -> Result<Self, PermissionError> {
        let name = name.into();
        validate(&name)?;
        Ok(Self(Cow::Owned(name)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Dot-separated namespace path (everything before `:`).
    pub fn path(&self) -> &str {
        self.as_str().split_once(':').map(|(p, _)| p).unwrap_or(self.as_str())
    }

    /// Action verb (everything after `:`).
    pub fn action(&self) -> &str {
        self.as_str().split_once(':').map(|(_, a)| a).unwrap_or("")
    }
}

fn validate(name: &str) -> Result<(), PermissionError> {
    let Some((path, action)) = name.split_once(':') else {
        return Err(PermissionError::MissingAction(name.to_string()));
    };
    if action.is_empty() || action.contains(':') {
        return Err(PermissionError::MissingAction(name.to_string()));
    }
    for segment in path.split('.').chain(std::iter::once(action)) {
        if segment.is_empty() {
            return Err(PermissionError::EmptySegment(name.to_string()));
        }
        if let Some(c) = segment.chars().find(|c| !is_segment_char(*c)) {
            return Err(PermissionError::InvalidCharacter(name.to_string(), c));
        }
    }
    Ok(())
}

/// Whether `c` may appear inside a path segment or action.
pub(crate) fn is_segment_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-'
}

impl TryFrom<String> for Permission {
    type Error = PermissionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Permission> for String {
    fn from(value: Permission) -> Self {
        value.0.into_owned()
    }
}

impl core::str::FromStr for Permission {
    type Err = PermissionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl core::fmt::Display for Permission {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Permission vocabulary used by the leash HTTP surface.
pub mod leash {
    use super::Permission;

    /// Baseline grant required to complete a login.
    pub const LOGIN: Permission = Permission::from_static("leash:login");

    pub const USERS_TARGET_SELF: Permission = Permission::from_static("leash.users:target_self");
    pub const USERS_TARGET_OTHERS: Permission = Permission::from_static("leash.users:target_others");
    pub const APIKEYS_TARGET: Permission = Permission::from_static("leash.apikeys:target");
}
