//! `leash-auth` — identity and access-control engine.
//!
//! This crate is intentionally decoupled from HTTP and from any concrete
//! database: storage and the identity provider are traits, and everything
//! else is pure logic over them.

pub mod authorize;
pub mod defaults;
pub mod error;
pub mod external;
pub mod identity;
pub mod login;
pub mod memory;
pub mod permissions;
pub mod policy;
pub mod prefix;
pub mod roles;
pub mod store;
pub mod subject;
pub mod token;

pub use authorize::{AuthorizationExplanation, AuthzError, authorize, explain_authorization};
pub use error::AuthError;
pub use external::{ExternalAuthError, ExternalAuthenticator};
pub use identity::{AuthenticationContext, Credential, IdentityResolver, SessionState};
pub use login::{IssuedToken, LoginConfig, LoginError, LoginManager, LoginSuccess};
pub use permissions::{Permission, PermissionError};
pub use policy::{Grant, PolicyAdapter, PolicyEngine, PolicyError, PolicySnapshot, RoleEdge};
pub use prefix::PermissionPrefix;
pub use roles::Role;
pub use store::{ApiKeyStore, CredentialStore, SessionStore, StoreError, UserStore};
pub use subject::{Subject, SubjectError};
pub use token::{SigningKeys, TokenCodec, TokenError, Verified};
