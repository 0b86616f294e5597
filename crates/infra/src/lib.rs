//! Infrastructure layer: Postgres storage, signing key files, identity providers.

pub mod google;
pub mod keys;
pub mod postgres;

pub use google::{GoogleAuthenticator, GoogleOAuthConfig};
pub use keys::{KeyFileError, load_or_generate};
pub use postgres::{PostgresCredentialStore, PostgresPolicyAdapter};
