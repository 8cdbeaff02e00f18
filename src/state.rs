//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::credentials::CredentialCache;
use crate::sessions::SessionRegistry;

/// Shared application state for the gateway.
#[derive(Clone)]
pub struct AppState {
    /// Live MCP sessions.
    pub sessions: SessionRegistry,
    /// Process-wide token cache (health reporting).
    pub credentials: Arc<CredentialCache>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
}

impl AppState {
    pub fn new(sessions: SessionRegistry, credentials: Arc<CredentialCache>) -> Self {
        Self {
            sessions,
            credentials,
            start_time: Instant::now(),
        }
    }
}
