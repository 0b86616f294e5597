//! `leash-core` — identity domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers and the user, API key and session records the access-control
//! engine reasons about.

pub mod error;
pub mod id;
pub mod model;

pub use error::{DomainError, DomainResult};
pub use id::{SessionId, UserId};
pub use model::{ApiKey, NewUser, Session, User, normalize_email};
