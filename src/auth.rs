//! Optional shared-secret authorization.
//!
//! When a secret is configured, every path except `/health` requires it,
//! either as a `?token=` query parameter or as an `Authorization: Bearer`
//! header. Without a configured secret the check lets everything through.

use std::collections::HashMap;

use axum::{
    extract::{Query, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::debug;

use crate::error::{AuthorizationError, GatewayError};

/// Extension type carrying the expected secret, injected into the router
/// layer so [`require_shared_secret`] can access it without touching
/// `AppState`. `None` disables the check.
#[derive(Clone)]
pub struct SharedSecret(pub Option<String>);

/// Axum middleware enforcing the [`SharedSecret`] extension.
///
/// # Error responses
///
/// - `401 Unauthorized`: no token supplied
/// - `403 Forbidden`: token supplied but wrong
pub async fn require_shared_secret(request: Request, next: Next) -> Response {
    let expected = match request.extensions().get::<SharedSecret>() {
        Some(SharedSecret(Some(secret))) => secret.clone(),
        _ => return next.run(request).await,
    };

    match check(&expected, provided_token(&request).as_deref()) {
        Ok(()) => next.run(request).await,
        Err(err) => {
            debug!("Rejected {} {}: {err}", request.method(), request.uri().path());
            GatewayError::from(err).into_response()
        }
    }
}

/// The token from `?token=`, falling back to the bearer header.
fn provided_token(request: &Request) -> Option<String> {
    let from_query = Query::<HashMap<String, String>>::try_from_uri(request.uri())
        .ok()
        .and_then(|Query(params)| params.get("token").cloned());
    if from_query.is_some() {
        return from_query;
    }
    request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn check(expected: &str, provided: Option<&str>) -> Result<(), AuthorizationError> {
    match provided {
        None | Some("") => Err(AuthorizationError::Missing),
        Some(token) if constant_time_eq(expected.as_bytes(), token.as_bytes()) => Ok(()),
        Some(_) => Err(AuthorizationError::Mismatch),
    }
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the secret length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, byte) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= byte ^ p;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret-longer"));
        assert!(!constant_time_eq(b"secret", b"sec"));
        assert!(!constant_time_eq(b"secret", b""));
    }

    #[test]
    fn check_classifies_failures() {
        assert_eq!(check("s3", None), Err(AuthorizationError::Missing));
        assert_eq!(check("s3", Some("")), Err(AuthorizationError::Missing));
        assert_eq!(check("s3", Some("nope")), Err(AuthorizationError::Mismatch));
        assert_eq!(check("s3", Some("s3")), Ok(()));
    }

    #[test]
    fn token_from_query_or_header() {
        let req = Request::builder()
            .uri("/mcp?token=abc")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(provided_token(&req).as_deref(), Some("abc"));

        let req = Request::builder()
            .uri("/mcp")
            .header("authorization", "Bearer xyz")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(provided_token(&req).as_deref(), Some("xyz"));

        let req = Request::builder()
            .uri("/mcp")
            .header("authorization", "Basic xyz")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(provided_token(&req), None);
    }
}
