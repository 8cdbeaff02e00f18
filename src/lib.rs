#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! ninjaone-mcp library: the gateway's building blocks:
//!
//! - `credentials`: shared OAuth2 token cache, endpoint auto-detection and pinning
//! - `upstream`: authenticated REST client over the token cache
//! - `tools`: MCP tool catalogue (descriptor map)
//! - `mcp`: per-session JSON-RPC protocol handler
//! - `sessions`: session registry and lifecycle
//! - `gateway`: payload classification and router assembly
//! - `auth`: optional shared-secret middleware
//! - `routes`: HTTP handlers for `/health` and `/mcp`
//! - `stdio`: single-session stdio transport
//! - `config`: TOML + env-var configuration

pub mod auth;
pub mod config;
pub mod credentials;
pub mod error;
pub mod gateway;
pub mod mcp;
pub mod routes;
pub mod sessions;
pub mod state;
pub mod stdio;
pub mod tools;
pub mod upstream;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use credentials::CredentialCache;
pub use error::GatewayError;
pub use mcp::HandlerContext;
pub use sessions::SessionRegistry;
pub use state::AppState;
pub use upstream::UpstreamClient;
