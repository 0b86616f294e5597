//! HTTP surface of the leash identity service.

pub mod app;
pub mod config;
pub mod context;
pub mod middleware;
