//! Authenticated HTTP client for the upstream REST API.
//!
//! [`UpstreamClient`] wraps `reqwest::Client` and performs one call per
//! invocation against the endpoint the [`CredentialCache`] resolved. Every
//! response comes back as `serde_json::Value`; the tool layer decides how to
//! present it.
//!
//! ## Response handling
//!
//! - Non-2xx: [`UpstreamError::Status`] with the status and the first
//!   [`MAX_ERROR_BODY`] characters of the body. A 401 also drops the cached
//!   token, if it is still the one the call used, so the next call
//!   re-authenticates.
//! - 2xx with an empty or non-JSON body (common for delete/reboot style
//!   endpoints): the [`success_marker`] instead of a parse error.
//! - No response caching: every call reaches the network.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde_json::{json, Value};
use tracing::debug;

use crate::credentials::{truncate, CredentialCache};
use crate::error::{GatewayError, UpstreamError};

/// Longest slice of an error body carried in [`UpstreamError::Status`].
pub const MAX_ERROR_BODY: usize = 512;

/// Returned for 2xx responses that carry no JSON document.
pub fn success_marker() -> Value {
    json!({ "success": true })
}

/// Build the HTTP client shared by the token cache and the upstream client.
pub fn build_http_client() -> Result<reqwest::Client, reqwest::Error> {
    let mut default_headers = reqwest::header::HeaderMap::new();
    default_headers.insert(
        reqwest::header::ACCEPT,
        reqwest::header::HeaderValue::from_static("application/json"),
    );
    reqwest::Client::builder()
        .default_headers(default_headers)
        .user_agent(concat!("ninjaone-mcp/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(10))
        .build()
}

/// HTTP client for business endpoints, shared by every session.
pub struct UpstreamClient {
    http: reqwest::Client,
    credentials: Arc<CredentialCache>,
    request_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(
        http: reqwest::Client,
        credentials: Arc<CredentialCache>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            http,
            credentials,
            request_timeout,
        }
    }

    /// The credential cache backing this client.
    pub fn credentials(&self) -> &Arc<CredentialCache> {
        &self.credentials
    }

    /// Perform one authenticated call.
    ///
    /// `path` is relative to the resolved base URL and must start with `/`.
    pub async fn call(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
    ) -> Result<Value, GatewayError> {
        let token = self.credentials.get_token().await?;

        let url = format!("{}{}", token.base_url, path);
        debug!("{method} {url}");
        let mut request = self
            .http
            .request(method, &url)
            .bearer_auth(&token.access_token)
            .timeout(self.request_timeout);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| self.transport_error(e, path))?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            self.credentials.invalidate_if(&token.access_token);
        }
        let text = resp
            .text()
            .await
            .map_err(|e| self.transport_error(e, path))?;
        Ok(parse_response(status, &text)?)
    }

    fn transport_error(&self, err: reqwest::Error, path: &str) -> UpstreamError {
        if err.is_timeout() {
            UpstreamError::Timeout {
                path: path.to_string(),
                timeout_ms: u64::try_from(self.request_timeout.as_millis()).unwrap_or(u64::MAX),
            }
        } else {
            UpstreamError::Transport(err.without_url().to_string())
        }
    }
}

/// Turn a status + body into a JSON value or an [`UpstreamError`].
fn parse_response(status: reqwest::StatusCode, body: &str) -> Result<Value, UpstreamError> {
    if !status.is_success() {
        return Err(UpstreamError::Status {
            status: status.as_u16(),
            body: truncate(body.trim(), MAX_ERROR_BODY),
        });
    }
    if body.trim().is_empty() {
        return Ok(success_marker());
    }
    Ok(serde_json::from_str(body).unwrap_or_else(|_| success_marker()))
}
