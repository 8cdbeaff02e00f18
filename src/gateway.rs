//! Inbound dispatch: payload classification and the HTTP router.
//!
//! [`Payload::parse`] decides what a POST body is before any session state is
//! touched. Malformed or ambiguous bodies are validation errors:
//!
//! - empty body, invalid JSON, or a JSON value that is neither an object nor
//!   an array
//! - an empty batch, or a batch element that is not an object
//! - a message with neither a `method` nor a `result`/`error`
//! - `initialize` inside a batch, or without an `id`

use axum::http::HeaderMap;
use axum::{middleware, routing::get, Extension, Router};
use serde_json::Value;

use crate::auth::{self, SharedSecret};
use crate::error::GatewayError;
use crate::routes;
use crate::AppState;

/// Header carrying the session id (lower-case, as `http` normalizes it).
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Session id from the request headers, if present and non-empty.
pub fn session_id(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty())
}

/// A classified POST body.
#[derive(Debug, PartialEq)]
pub enum Payload {
    /// A lone `initialize` request.
    Initialize(Value),
    /// Messages for an existing session, in order.
    Messages { messages: Vec<Value>, batch: bool },
}

impl Payload {
    pub fn parse(body: &[u8]) -> Result<Self, GatewayError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(GatewayError::Validation("empty request body".to_string()));
        }
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| GatewayError::Validation(format!("invalid JSON: {e}")))?;

        match value {
            Value::Array(messages) => {
                if messages.is_empty() {
                    return Err(GatewayError::Validation("empty batch".to_string()));
                }
                for message in &messages {
                    if !message.is_object() {
                        return Err(GatewayError::Validation(
                            "batch elements must be objects".to_string(),
                        ));
                    }
                    ensure_message(message)?;
                    if is_initialize(message) {
                        return Err(GatewayError::Validation(
                            "initialize must be sent on its own".to_string(),
                        ));
                    }
                }
                Ok(Self::Messages {
                    messages,
                    batch: true,
                })
            }
            Value::Object(_) if is_initialize(&value) => {
                if value.get("id").is_none_or(Value::is_null) {
                    return Err(GatewayError::Validation(
                        "initialize must carry an id".to_string(),
                    ));
                }
                Ok(Self::Initialize(value))
            }
            Value::Object(_) => {
                ensure_message(&value)?;
                Ok(Self::Messages {
                    messages: vec![value],
                    batch: false,
                })
            }
            _ => Err(GatewayError::Validation(
                "payload must be a JSON-RPC object or batch".to_string(),
            )),
        }
    }
}

/// A request or notification names a method; a response carries a result
/// or an error. Anything else cannot be routed.
fn ensure_message(message: &Value) -> Result<(), GatewayError> {
    let routable = message.get("method").is_some_and(Value::is_string)
        || message.get("result").is_some()
        || message.get("error").is_some();
    if routable {
        Ok(())
    } else {
        Err(GatewayError::Validation(
            "message has no method, result or error".to_string(),
        ))
    }
}

fn is_initialize(message: &Value) -> bool {
    message.get("method").and_then(Value::as_str) == Some("initialize")
}

/// Assemble the router: `/health` is public, `/mcp` sits behind the
/// shared-secret check.
pub fn router(state: AppState, shared_secret: Option<String>) -> Router {
    let public_routes = Router::new().route("/health", get(routes::health::health));

    let authed_routes = Router::new()
        .route(
            "/mcp",
            get(routes::mcp::stream)
                .post(routes::mcp::post)
                .delete(routes::mcp::delete),
        )
        .layer(middleware::from_fn(auth::require_shared_secret));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .layer(Extension(SharedSecret(shared_secret)))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::credentials::{
        CacheSettings, CredentialCache, CredentialSet, EndpointPolicy, Region, TOKEN_PATH,
    };
    use crate::mcp::HandlerContext;
    use crate::sessions::SessionRegistry;
    use crate::upstream::UpstreamClient;

    fn app_with(base_url: Option<String>, secret: Option<&str>) -> Router {
        let policy = match &base_url {
            Some(url) => EndpointPolicy::new(
                vec![Region {
                    key: "mock".into(),
                    base_url: url.clone(),
                }],
                "ninjarmm.com",
            ),
            None => EndpointPolicy::with_default_regions("ninjarmm.com"),
        };
        let credentials = base_url.as_ref().map(|_| CredentialSet {
            client_id: "id".into(),
            client_secret: "secret".into(),
        });
        let cache = Arc::new(CredentialCache::new(CacheSettings {
            credentials,
            policy,
            candidates: vec![],
            explicit_endpoint: None,
            scope: "monitoring".into(),
            token_timeout: Duration::from_secs(2),
            http: reqwest::Client::new(),
        }));
        let upstream = Arc::new(UpstreamClient::new(
            reqwest::Client::new(),
            Arc::clone(&cache),
            Duration::from_secs(2),
        ));
        let sessions = SessionRegistry::new(HandlerContext::new(upstream), 10);
        router(AppState::new(sessions, cache), secret.map(str::to_string))
    }

    fn app() -> Router {
        app_with(None, None)
    }

    fn post(body: &Value, session: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/mcp")
            .header("content-type", "application/json");
        if let Some(id) = session {
            builder = builder.header(SESSION_HEADER, id);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn initialize_request() -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": { "protocolVersion": "2025-03-26" }
        })
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn initialize(app: &Router) -> String {
        let response = app
            .clone()
            .oneshot(post(&initialize_request(), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        response.headers()[SESSION_HEADER]
            .to_str()
            .unwrap()
            .to_string()
    }

    #[test]
    fn classify_payloads() {
        assert!(matches!(
            Payload::parse(initialize_request().to_string().as_bytes()),
            Ok(Payload::Initialize(_))
        ));
        assert_eq!(
            Payload::parse(br#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).unwrap(),
            Payload::Messages {
                messages: vec![json!({"jsonrpc": "2.0", "id": 1, "method": "ping"})],
                batch: false,
            }
        );
        assert!(matches!(
            Payload::parse(br#"[{"jsonrpc":"2.0","id":1,"method":"ping"}]"#),
            Ok(Payload::Messages { batch: true, .. })
        ));
    }

    #[test]
    fn reject_ambiguous_payloads() {
        for body in [
            &b""[..],
            b"   ",
            b"{not json",
            b"[]",
            b"42",
            b"[1, 2]",
            br#"[{"jsonrpc":"2.0","id":1,"method":"initialize"},{"jsonrpc":"2.0","id":2,"method":"ping"}]"#,
            br#"{"jsonrpc":"2.0","method":"initialize"}"#,
            b"{}",
            br#"{"jsonrpc":"2.0"}"#,
            br#"{"jsonrpc":"2.0","id":3}"#,
            br#"{"jsonrpc":"2.0","method":7}"#,
            br#"[{"jsonrpc":"2.0","id":1,"method":"ping"},{"jsonrpc":"2.0"}]"#,
        ] {
            assert!(
                matches!(Payload::parse(body), Err(GatewayError::Validation(_))),
                "accepted {:?}",
                String::from_utf8_lossy(body)
            );
        }
    }

    #[test]
    fn client_responses_are_routable() {
        assert!(matches!(
            Payload::parse(br#"{"jsonrpc":"2.0","id":9,"result":{}}"#),
            Ok(Payload::Messages { batch: false, .. })
        ));
        assert!(matches!(
            Payload::parse(br#"[{"jsonrpc":"2.0","id":9,"error":{"code":1,"message":"x"}}]"#),
            Ok(Payload::Messages { batch: true, .. })
        ));
    }

    #[tokio::test]
    async fn empty_object_is_rejected_with_live_session() {
        let app = app();
        let id = initialize(&app).await;
        let response = app.oneshot(post(&json!({}), Some(&id))).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn session_header_lookup() {
        let mut headers = HeaderMap::new();
        assert_eq!(session_id(&headers), None);
        headers.insert(SESSION_HEADER, "  ".parse().unwrap());
        assert_eq!(session_id(&headers), None);
        headers.insert(SESSION_HEADER, " abc ".parse().unwrap());
        assert_eq!(session_id(&headers), Some("abc"));
    }

    #[tokio::test]
    async fn health_is_exempt_from_auth() {
        let app = app_with(None, Some("s3cret"));
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["sessions"], 0);
        assert_eq!(body["upstream"]["configured"], false);
    }

    #[tokio::test]
    async fn mcp_requires_secret_when_configured() {
        let app = app_with(None, Some("s3cret"));

        let missing = app
            .clone()
            .oneshot(post(&initialize_request(), None))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let mut wrong = post(&initialize_request(), None);
        wrong
            .headers_mut()
            .insert("authorization", "Bearer nope".parse().unwrap());
        assert_eq!(
            app.clone().oneshot(wrong).await.unwrap().status(),
            StatusCode::FORBIDDEN
        );

        let query = Request::post("/mcp?token=s3cret")
            .header("content-type", "application/json")
            .body(Body::from(initialize_request().to_string()))
            .unwrap();
        assert_eq!(app.oneshot(query).await.unwrap().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn initialize_mints_distinct_sessions() {
        let app = app();
        let a = initialize(&app).await;
        let b = initialize(&app).await;
        assert_ne!(a, b);

        // A supplied id is ignored by initialize.
        let response = app
            .clone()
            .oneshot(post(&initialize_request(), Some(&a)))
            .await
            .unwrap();
        let c = response.headers()[SESSION_HEADER].to_str().unwrap();
        assert_ne!(c, a);
        assert_ne!(c, b);
    }

    #[tokio::test]
    async fn initialize_response_negotiates_version() {
        let response = app()
            .oneshot(post(&initialize_request(), None))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["id"], 1);
        assert_eq!(body["result"]["protocolVersion"], "2025-03-26");
    }

    #[tokio::test]
    async fn requests_need_a_known_session() {
        let app = app();
        let ping = json!({"jsonrpc": "2.0", "id": 2, "method": "ping"});

        let missing = app.clone().oneshot(post(&ping, None)).await.unwrap();
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

        let unknown = app
            .clone()
            .oneshot(post(&ping, Some("not-a-session")))
            .await
            .unwrap();
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_body_is_rejected_before_session_lookup() {
        let app = app();
        let request = Request::post("/mcp")
            .header(SESSION_HEADER, "not-a-session")
            .body(Body::from("[]"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"]["message"].as_str().unwrap().contains("empty batch"));
    }

    #[tokio::test]
    async fn notifications_are_accepted_without_body() {
        let app = app();
        let id = initialize(&app).await;
        let response = app
            .oneshot(post(
                &json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
                Some(&id),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn batch_gets_array_response() {
        let app = app();
        let id = initialize(&app).await;
        let batch = json!([
            {"jsonrpc": "2.0", "id": 10, "method": "ping"},
            {"jsonrpc": "2.0", "method": "notifications/initialized"},
            {"jsonrpc": "2.0", "id": 11, "method": "tools/list"},
        ]);
        let response = app.oneshot(post(&batch, Some(&id))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let items = body.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["id"], 10);
        assert!(items[1]["result"]["tools"].is_array());
    }

    #[tokio::test]
    async fn delete_retires_the_session() {
        let app = app();
        let id = initialize(&app).await;

        let delete = Request::delete("/mcp")
            .header(SESSION_HEADER, &id)
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(delete).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["session_id"], id.as_str());

        let ping = json!({"jsonrpc": "2.0", "id": 3, "method": "ping"});
        let after = app.clone().oneshot(post(&ping, Some(&id))).await.unwrap();
        assert_eq!(after.status(), StatusCode::NOT_FOUND);

        let again = Request::delete("/mcp")
            .header(SESSION_HEADER, &id)
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            app.oneshot(again).await.unwrap().status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn stream_requires_known_session() {
        let app = app();
        let request = Request::get("/mcp")
            .header(SESSION_HEADER, "missing")
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            app.oneshot(request).await.unwrap().status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn sessions_share_one_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(TOKEN_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "tok",
                "expires_in": 3600,
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2/organizations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}])))
            .expect(2)
            .mount(&server)
            .await;

        let app = app_with(Some(server.uri()), None);
        let call = json!({
            "jsonrpc": "2.0",
            "id": 5,
            "method": "tools/call",
            "params": { "name": "list_organizations", "arguments": {} }
        });
        for _ in 0..2 {
            let id = initialize(&app).await;
            let response = app.clone().oneshot(post(&call, Some(&id))).await.unwrap();
            let body = body_json(response).await;
            assert!(body["result"].get("isError").is_none(), "{body}");
            assert_eq!(body["id"], 5);
        }
    }
}
