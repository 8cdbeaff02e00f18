//! MCP over stdio.
//!
//! Reads newline-delimited JSON-RPC from stdin and writes responses to
//! stdout, one line each. A single handler serves the whole process; server
//! push messages (e.g. from `set_region`) are written right after the
//! response that caused them. Logs go to stderr.

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{jsonrpc_error, INVALID_REQUEST, PARSE_ERROR};
use crate::mcp::{HandlerContext, McpHandler};

/// Run the MCP server on stdio until EOF.
pub async fn run_stdio(ctx: HandlerContext) {
    serve(ctx, tokio::io::stdin(), tokio::io::stdout()).await;
}

/// Serve one handler over an arbitrary reader/writer pair.
pub async fn serve<R, W>(ctx: HandlerContext, input: R, mut output: W)
where
    R: tokio::io::AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (notifier, mut pushed) = broadcast::channel(64);
    let mut handler = McpHandler::new(ctx, notifier);
    let mut reader = BufReader::new(input);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                warn!("stdin read error: {e}");
                break;
            }
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Value>(trimmed) {
            Err(e) => Some(jsonrpc_error(None, PARSE_ERROR, format!("Parse error: {e}"))),
            Ok(Value::Array(messages)) if messages.is_empty() => {
                Some(jsonrpc_error(None, INVALID_REQUEST, "Empty batch"))
            }
            Ok(Value::Array(messages)) => {
                let mut responses = Vec::new();
                for message in messages {
                    if let Some(response) = dispatch(&mut handler, message).await {
                        responses.push(response);
                    }
                }
                (!responses.is_empty()).then_some(Value::Array(responses))
            }
            Ok(message) => dispatch(&mut handler, message).await,
        };

        if let Some(response) = response {
            write_message(&mut output, &response).await;
        }
        while let Ok(message) = pushed.try_recv() {
            write_message(&mut output, &message).await;
        }
    }
    debug!("stdin closed, stopping");
}

/// Hand one message to the handler. Values that are not JSON-RPC messages
/// at all get an Invalid Request reply instead of being dropped.
async fn dispatch(handler: &mut McpHandler, message: Value) -> Option<Value> {
    let routable = message.get("method").is_some()
        || message.get("id").is_some()
        || message.get("result").is_some()
        || message.get("error").is_some();
    if !message.is_object() || !routable {
        return Some(jsonrpc_error(None, INVALID_REQUEST, "Invalid request"));
    }
    handler.handle(message).await
}

/// Write one JSON-RPC message (one line, flushed immediately).
async fn write_message<W: AsyncWrite + Unpin>(output: &mut W, message: &Value) {
    let mut text = serde_json::to_string(message).unwrap_or_default();
    text.push('\n');
    if let Err(e) = output.write_all(text.as_bytes()).await {
        warn!("stdout write error: {e}");
    }
    if let Err(e) = output.flush().await {
        warn!("stdout flush error: {e}");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::credentials::{CacheSettings, CredentialCache, EndpointPolicy};
    use crate::upstream::UpstreamClient;

    fn ctx() -> HandlerContext {
        let cache = CredentialCache::new(CacheSettings {
            credentials: None,
            policy: EndpointPolicy::with_default_regions("ninjarmm.com"),
            candidates: vec![],
            explicit_endpoint: None,
            scope: String::new(),
            token_timeout: Duration::from_secs(1),
            http: reqwest::Client::new(),
        });
        HandlerContext::new(Arc::new(UpstreamClient::new(
            reqwest::Client::new(),
            Arc::new(cache),
            Duration::from_secs(1),
        )))
    }

    async fn run(input: &str) -> Vec<Value> {
        let mut output = Vec::new();
        serve(ctx(), input.as_bytes(), &mut output).await;
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn request_response_over_lines() {
        let input = [
            json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}).to_string(),
            json!({"jsonrpc": "2.0", "method": "notifications/initialized"}).to_string(),
            String::new(),
            json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}).to_string(),
        ]
        .join("\n");
        let out = run(&input).await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["id"], 1);
        assert_eq!(out[1], json!({"jsonrpc": "2.0", "id": 2, "result": {}}));
    }

    #[tokio::test]
    async fn parse_error_and_empty_batch() {
        let out = run("{oops\n[]\n").await;
        assert_eq!(out[0]["error"]["code"], PARSE_ERROR);
        assert_eq!(out[1]["error"]["code"], INVALID_REQUEST);
    }

    #[tokio::test]
    async fn non_messages_get_invalid_request() {
        let input = [
            "42".to_string(),
            json!([1, {"jsonrpc": "2.0", "id": 3, "method": "ping"}]).to_string(),
            "{}".to_string(),
        ]
        .join("\n");
        let out = run(&input).await;
        assert_eq!(out.len(), 3);
        assert_eq!(out[0]["error"]["code"], INVALID_REQUEST);
        assert_eq!(out[0]["id"], Value::Null);

        let batch = out[1].as_array().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0]["error"]["code"], INVALID_REQUEST);
        assert_eq!(batch[1]["id"], 3);

        assert_eq!(out[2]["error"]["code"], INVALID_REQUEST);
    }

    #[tokio::test]
    async fn pushed_message_follows_response() {
        let input = [
            json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}).to_string(),
            json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "tools/call",
                "params": { "name": "set_region", "arguments": { "region": "oc" } }
            })
            .to_string(),
        ]
        .join("\n");
        let out = run(&input).await;
        assert_eq!(out.len(), 3);
        assert_eq!(out[1]["id"], 2);
        assert_eq!(out[2]["method"], "notifications/message");
    }
}
