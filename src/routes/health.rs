//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /health`: liveness probe.
///
/// Returns status, uptime, version, session count, and the upstream endpoint
/// summary. No authorization required, suitable for load-balancer checks.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let sessions = state.sessions.count().await;
    let upstream = state.credentials.snapshot();

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": sessions,
        "upstream": {
            "configured": upstream.configured,
            "base_url": upstream.endpoint.base_url,
            "explicit": upstream.endpoint.explicit,
            "token_cached": upstream.token_cached,
        },
    }))
}
