//! Gateway error taxonomy.
//!
//! Every failure that can reach a client is one of these variants. The HTTP
//! boundary renders them as JSON-RPC error objects with a matching status
//! code; inside a session, upstream and credential failures become tool
//! results with `isError: true` instead.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

use crate::credentials::{CredentialError, EndpointAttempt};

/// JSON-RPC: invalid JSON.
pub const PARSE_ERROR: i64 = -32700;
/// JSON-RPC: not a valid request object.
pub const INVALID_REQUEST: i64 = -32600;
/// JSON-RPC: unknown method.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC: bad params.
pub const INVALID_PARAMS: i64 = -32602;
/// Server-defined: session missing, unknown, closed or over limit.
pub const SESSION_ERROR: i64 = -32000;
/// Server-defined: shared-secret check failed.
pub const UNAUTHORIZED: i64 = -32001;
/// Server-defined: request before `initialize`.
pub const NOT_INITIALIZED: i64 = -32002;
/// Server-defined: upstream, credential or configuration failure.
pub const UPSTREAM_FAILURE: i64 = -32003;

/// Failure of a single business call against the upstream API.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("upstream call to {path} timed out after {timeout_ms} ms")]
    Timeout { path: String, timeout_ms: u64 },
    #[error("upstream request failed: {0}")]
    Transport(String),
}

/// Why a session lookup or creation failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("missing Mcp-Session-Id header")]
    Missing,
    #[error("unknown session {0}")]
    Unknown(String),
    #[error("session {0} has been closed")]
    Closed(String),
    #[error("session limit reached (max {0})")]
    LimitReached(usize),
}

/// Why the shared-secret check rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthorizationError {
    #[error("missing access token")]
    Missing,
    #[error("invalid access token")]
    Mismatch,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("authentication with the upstream API failed: {}", describe(.attempts))]
    AuthAcquisition { attempts: Vec<EndpointAttempt> },
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Authorization(#[from] AuthorizationError),
    #[error("invalid request: {0}")]
    Validation(String),
}

fn describe(attempts: &[EndpointAttempt]) -> String {
    attempts
        .iter()
        .map(|a| format!("{} ({})", a.endpoint, a.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<CredentialError> for GatewayError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::NotConfigured => {
                Self::Configuration(CredentialError::NotConfigured.to_string())
            }
            CredentialError::Acquisition { attempts } => Self::AuthAcquisition { attempts },
            CredentialError::EndpointRejected(reason) => Self::Validation(reason),
        }
    }
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::AuthAcquisition { .. } | Self::Upstream(UpstreamError::Status { .. }) => {
                StatusCode::BAD_GATEWAY
            }
            Self::Upstream(UpstreamError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            Self::Upstream(UpstreamError::Transport(_)) => StatusCode::BAD_GATEWAY,
            Self::Session(SessionError::Missing) | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Session(SessionError::Unknown(_) | SessionError::Closed(_)) => {
                StatusCode::NOT_FOUND
            }
            Self::Session(SessionError::LimitReached(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Authorization(AuthorizationError::Missing) => StatusCode::UNAUTHORIZED,
            Self::Authorization(AuthorizationError::Mismatch) => StatusCode::FORBIDDEN,
        }
    }

    pub fn jsonrpc_code(&self) -> i64 {
        match self {
            Self::Validation(_) => INVALID_REQUEST,
            Self::Session(_) => SESSION_ERROR,
            Self::Authorization(_) => UNAUTHORIZED,
            Self::Configuration(_) | Self::AuthAcquisition { .. } | Self::Upstream(_) => {
                UPSTREAM_FAILURE
            }
        }
    }

    /// Upstream status for `Upstream(Status)` errors.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            Self::Upstream(UpstreamError::Status { status, .. }) => Some(*status),
            _ => None,
        }
    }
}

/// A JSON-RPC 2.0 error object.
pub fn jsonrpc_error(id: Option<Value>, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id.unwrap_or(Value::Null),
        "error": {
            "code": code,
            "message": message.into(),
        }
    })
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = jsonrpc_error(None, self.jsonrpc_code(), self.to_string());
        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_errors_map_to_taxonomy() {
        assert!(matches!(
            GatewayError::from(CredentialError::NotConfigured),
            GatewayError::Configuration(_)
        ));
        assert!(matches!(
            GatewayError::from(CredentialError::Acquisition { attempts: vec![] }),
            GatewayError::AuthAcquisition { .. }
        ));
        assert!(matches!(
            GatewayError::from(CredentialError::EndpointRejected("nope".into())),
            GatewayError::Validation(_)
        ));
    }

    #[test]
    fn session_errors_map_to_client_statuses() {
        assert_eq!(
            GatewayError::from(SessionError::Missing).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::from(SessionError::Unknown("x".into())).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::from(SessionError::Closed("x".into())).status_code(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn authorization_statuses() {
        assert_eq!(
            GatewayError::from(AuthorizationError::Missing).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::from(AuthorizationError::Mismatch).status_code(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn acquisition_message_lists_endpoints() {
        let err = GatewayError::AuthAcquisition {
            attempts: vec![
                EndpointAttempt {
                    endpoint: "https://app.ninjarmm.com".into(),
                    reason: "HTTP 401: unauthorized".into(),
                },
                EndpointAttempt {
                    endpoint: "https://eu.ninjarmm.com".into(),
                    reason: "timed out after 10s".into(),
                },
            ],
        };
        let message = err.to_string();
        assert!(message.contains("https://app.ninjarmm.com (HTTP 401: unauthorized)"));
        assert!(message.contains("https://eu.ninjarmm.com (timed out after 10s)"));
    }

    #[test]
    fn jsonrpc_error_shape() {
        let value = jsonrpc_error(Some(json!(7)), METHOD_NOT_FOUND, "nope");
        assert_eq!(value["id"], 7);
        assert_eq!(value["error"]["code"], METHOD_NOT_FOUND);
        assert_eq!(value["error"]["message"], "nope");
    }
}
