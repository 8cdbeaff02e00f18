//! MCP Streamable HTTP endpoint.
//!
//! | Method   | Behaviour                                                  |
//! |----------|------------------------------------------------------------|
//! | `POST`   | `initialize` creates a session; anything else is routed to |
//! |          | the session named by `Mcp-Session-Id`                      |
//! | `GET`    | Server-Sent Events stream of server-initiated messages     |
//! | `DELETE` | Close the session                                          |

use std::convert::Infallible;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::Stream;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::error::{GatewayError, SessionError};
use crate::gateway::{session_id, Payload, SESSION_HEADER};
use crate::AppState;

/// `POST /mcp`
pub async fn post(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    match Payload::parse(&body)? {
        Payload::Initialize(message) => {
            if let Some(stale) = session_id(&headers) {
                debug!("initialize carried session id {stale}; creating a new session");
            }
            let session = state.sessions.create().await?;
            let id = session.id().to_string();
            let response = session.handle(message).await?.unwrap_or(Value::Null);
            Ok(([(SESSION_HEADER, id)], Json(response)).into_response())
        }
        Payload::Messages { messages, batch } => {
            let id = session_id(&headers).ok_or(SessionError::Missing)?;
            let session = state.sessions.get(id).await?;
            let mut responses = session.handle_all(messages).await?;

            if responses.is_empty() {
                return Ok(StatusCode::ACCEPTED.into_response());
            }
            let body = if batch {
                Value::Array(responses)
            } else {
                responses.swap_remove(0)
            };
            Ok(Json(body).into_response())
        }
    }
}

/// `GET /mcp`: SSE stream, open until the client leaves or the session closes.
pub async fn stream(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, GatewayError> {
    let id = session_id(&headers).ok_or(SessionError::Missing)?;
    let session = state.sessions.get(id).await?;
    let rx = session.subscribe();
    let closed = session.closed_token();
    debug!("Session {id} opened push stream");

    let stream = futures::stream::unfold((rx, closed), |(mut rx, closed)| async move {
        loop {
            tokio::select! {
                () = closed.cancelled() => return None,
                msg = rx.recv() => match msg {
                    Ok(value) => {
                        let data = serde_json::to_string(&value).unwrap_or_default();
                        let event = Event::default().event("message").data(data);
                        return Some((Ok(event), (rx, closed)));
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!("Push stream lagged, {n} messages dropped");
                    }
                    Err(RecvError::Closed) => return None,
                },
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default().interval(Duration::from_secs(15))))
}

/// `DELETE /mcp`
pub async fn delete(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, GatewayError> {
    let id = session_id(&headers).ok_or(SessionError::Missing)?;
    state.sessions.close(id).await?;
    Ok(Json(json!({ "ok": true, "session_id": id })))
}
