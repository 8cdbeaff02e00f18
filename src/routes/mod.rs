//! HTTP route handlers.
//!
//! [`health`] is public; [`mcp`] requires the shared secret via the
//! [`crate::auth::require_shared_secret`] middleware when one is configured.

pub mod health;
pub mod mcp;
