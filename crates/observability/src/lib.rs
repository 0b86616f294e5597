//! Process-wide tracing setup shared by the leash binaries.

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use self::tracing::{LogFormat, init};
