use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use leash_core::{ApiKey, User, UserId};

use crate::Role;

/// Key into the policy engine's grant relation.
///
/// Subjects are never created on their own; they are derived from a role,
/// a user or an API key and rendered as `role:<name>`, `user:<id>` or
/// `apikey:<key>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Subject {
    Role(Role),
    User(UserId),
    ApiKey(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubjectError {
    #[error("subject '{0}' has no namespace (expected role:, user: or apikey:)")]
    MissingNamespace(String),

    #[error("unknown subject namespace '{0}'")]
    UnknownNamespace(String),

    #[error("subject '{0}' has an empty or invalid value")]
    InvalidValue(String),
}

impl Subject {
    pub fn for_user(user: &User) -> Self {
        Self::User(user.id)
    }

    pub fn for_api_key(key: &ApiKey) -> Self {
        Self::ApiKey(key.key.clone())
    }

    pub fn role(name: impl Into<std::borrow::Cow<'static, str>>) -> Self {
        Self::Role(Role::new(name))
    }

    pub fn as_role(&self) -> Option<&Role> {
        match self {
            Self::Role(role) => Some(role),
            _ => None,
        }
    }

    /// Log-safe rendering; API key values are shortened.
    pub fn redacted(&self) -> String {
        match self {
            Self::ApiKey(key) => format!("apikey:{}", leash_core::model::fingerprint(key)),
            other => other.to_string(),
        }
    }
}

impl From<Role> for Subject {
    fn from(value: Role) -> Self {
        Self::Role(value)
    }
}

impl core::fmt::Display for Subject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Role(role) => write!(f, "role:{role}"),
            Self::User(id) => write!(f, "user:{id}"),
            Self::ApiKey(key) => write!(f, "apikey:{key}"),
        }
    }
}

impl FromStr for Subject {
    type Err = SubjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, value) = s
            .split_once(':')
            .ok_or_else(|| SubjectError::MissingNamespace(s.to_string()))?;
        if value.is_empty() {
            return Err(SubjectError::InvalidValue(s.to_string()));
        }
        match namespace {
            "role" => Ok(Self::Role(Role::new(value.to_string()))),
            "user" => value
                .parse::<UserId>()
                .map(Self::User)
                .map_err(|_| SubjectError::InvalidValue(s.to_string())),
            "apikey" => Ok(Self::ApiKey(value.to_string())),
            other => Err(SubjectError::UnknownNamespace(other.to_string())),
        }
    }
}

impl TryFrom<String> for Subject {
    type Error = SubjectError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Subject> for String {
    fn from(value: Subject) -> Self {
        value.to_string()
    }
}
