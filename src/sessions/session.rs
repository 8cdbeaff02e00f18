//! A single MCP session.
//!
//! An [`McpSession`] owns one [`McpHandler`] behind a tokio `Mutex`, which
//! queues waiters in FIFO order, so the requests of one session run in
//! arrival order while sessions stay independent of each other.
//!
//! Closing cancels the session's [`CancellationToken`] without taking the
//! handler lock: a call already inside the handler finishes, anything still
//! queued sees the session as closed, and open push streams end.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::credentials::now_ms;
use crate::error::SessionError;
use crate::mcp::{HandlerContext, McpHandler};

/// Capacity of the per-session push channel.
const OUTBOUND_CAPACITY: usize = 64;

pub struct McpSession {
    id: String,
    /// Epoch milliseconds when the session was created.
    created_at: u64,
    handler: tokio::sync::Mutex<McpHandler>,
    last_activity: Mutex<Instant>,
    outbound: broadcast::Sender<Value>,
    closed: CancellationToken,
}

impl std::fmt::Debug for McpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpSession")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl McpSession {
    /// Build a fully initialized session. Registration is the caller's job.
    pub fn new(id: String, ctx: HandlerContext) -> Self {
        let (outbound, _) = broadcast::channel(OUTBOUND_CAPACITY);
        Self {
            handler: tokio::sync::Mutex::new(McpHandler::new(ctx, outbound.clone())),
            id,
            created_at: now_ms(),
            last_activity: Mutex::new(Instant::now()),
            outbound,
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Process `messages` in order under one handler lock and collect the
    /// responses. Notifications produce none.
    pub async fn handle_all(&self, messages: Vec<Value>) -> Result<Vec<Value>, SessionError> {
        self.ensure_open()?;
        let mut handler = self.handler.lock().await;
        // Closed while queued behind another request.
        self.ensure_open()?;
        self.touch();

        let mut responses = Vec::with_capacity(messages.len());
        for message in messages {
            if let Some(response) = handler.handle(message).await {
                responses.push(response);
            }
        }
        self.touch();
        Ok(responses)
    }

    /// Process a single message.
    pub async fn handle(&self, message: Value) -> Result<Option<Value>, SessionError> {
        Ok(self.handle_all(vec![message]).await?.into_iter().next())
    }

    /// Subscribe to server-initiated messages.
    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.touch();
        self.outbound.subscribe()
    }

    /// Number of open push streams.
    pub fn subscribers(&self) -> usize {
        self.outbound.receiver_count()
    }

    /// Resolves once the session is closed.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Mark the session closed. Never waits on an in-flight call.
    pub fn close(&self) {
        self.closed.cancel();
        if let Ok(mut handler) = self.handler.try_lock() {
            handler.close();
        }
    }

    /// Time since the last request or stream subscription.
    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            Err(SessionError::Closed(self.id.clone()))
        } else {
            Ok(())
        }
    }
}
