//! Session lifecycle management.
//!
//! [`SessionRegistry`] is the single authority for creating, looking up, and
//! closing MCP sessions. A session moves `UNINITIALIZED → ACTIVE → CLOSED`:
//! it is registered only once fully constructed, and a closed id is retired
//! forever. Retired ids are remembered so lookups report them as closed and
//! [`SessionRegistry::create`] never mints them again.
//!
//! ## Concurrency
//!
//! The maps are behind an `RwLock`. Lookups take a read lock; create, close,
//! and sweep take a write lock. `create` holds the write lock across the
//! limit check and insert to prevent TOCTOU races.

pub mod session;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::SessionError;
use crate::mcp::HandlerContext;
pub use session::McpSession;

struct RegistryState {
    live: HashMap<String, Arc<McpSession>>,
    /// Ids of closed sessions. Grows for the life of the process.
    retired: HashSet<String>,
}

/// Registry of live MCP sessions.
///
/// Cloneable: all clones share the same inner `Arc<RwLock<...>>`.
#[derive(Clone)]
pub struct SessionRegistry {
    state: Arc<RwLock<RegistryState>>,
    /// 0 = unlimited.
    max_sessions: usize,
    ctx: HandlerContext,
}

impl SessionRegistry {
    pub fn new(ctx: HandlerContext, max_sessions: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(RegistryState {
                live: HashMap::new(),
                retired: HashSet::new(),
            })),
            max_sessions,
            ctx,
        }
    }

    /// Create and register a new session with a fresh random id.
    pub async fn create(&self) -> Result<Arc<McpSession>, SessionError> {
        let mut state = self.state.write().await;
        if self.max_sessions > 0 && state.live.len() >= self.max_sessions {
            return Err(SessionError::LimitReached(self.max_sessions));
        }

        let id = loop {
            let candidate = Uuid::new_v4().to_string();
            if !state.live.contains_key(&candidate) && !state.retired.contains(&candidate) {
                break candidate;
            }
        };

        let session = Arc::new(McpSession::new(id.clone(), self.ctx.clone()));
        state.live.insert(id.clone(), Arc::clone(&session));
        info!("Session {id} created ({} active)", state.live.len());
        Ok(session)
    }

    /// Look up a live session.
    pub async fn get(&self, id: &str) -> Result<Arc<McpSession>, SessionError> {
        let state = self.state.read().await;
        if let Some(session) = state.live.get(id) {
            return Ok(Arc::clone(session));
        }
        if state.retired.contains(id) {
            Err(SessionError::Closed(id.to_string()))
        } else {
            Err(SessionError::Unknown(id.to_string()))
        }
    }

    /// Close a session and retire its id.
    pub async fn close(&self, id: &str) -> Result<(), SessionError> {
        let mut state = self.state.write().await;
        let Some(session) = state.live.remove(id) else {
            return Err(if state.retired.contains(id) {
                SessionError::Closed(id.to_string())
            } else {
                SessionError::Unknown(id.to_string())
            });
        };
        state.retired.insert(id.to_string());
        session.close();
        info!("Session {id} closed ({} active)", state.live.len());
        Ok(())
    }

    pub async fn count(&self) -> usize {
        self.state.read().await.live.len()
    }

    /// Close sessions idle for longer than `timeout` that have no open push
    /// stream. Returns the closed ids.
    pub async fn sweep_idle(&self, timeout: Duration) -> Vec<String> {
        let mut state = self.state.write().await;
        let expired: Vec<String> = state
            .live
            .values()
            .filter(|s| s.subscribers() == 0 && s.idle_for() > timeout)
            .map(|s| s.id().to_string())
            .collect();

        for id in &expired {
            if let Some(session) = state.live.remove(id) {
                session.close();
            }
            state.retired.insert(id.clone());
            info!("Session {id} closed after {}s idle", timeout.as_secs());
        }
        expired
    }

    /// Close every session (shutdown). Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let mut state = self.state.write().await;
        let sessions: Vec<(String, Arc<McpSession>)> = state.live.drain().collect();
        for (id, session) in &sessions {
            session.close();
            debug!("Session {id} closed on shutdown");
        }
        state
            .retired
            .extend(sessions.iter().map(|(id, _)| id.clone()));
        sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::credentials::{CacheSettings, CredentialCache, EndpointPolicy};
    use crate::upstream::UpstreamClient;

    fn registry(max_sessions: usize) -> SessionRegistry {
        let cache = CredentialCache::new(CacheSettings {
            credentials: None,
            policy: EndpointPolicy::with_default_regions("ninjarmm.com"),
            candidates: vec![],
            explicit_endpoint: None,
            scope: String::new(),
            token_timeout: Duration::from_secs(1),
            http: reqwest::Client::new(),
        });
        let upstream = UpstreamClient::new(
            reqwest::Client::new(),
            Arc::new(cache),
            Duration::from_secs(1),
        );
        SessionRegistry::new(HandlerContext::new(Arc::new(upstream)), max_sessions)
    }

    #[tokio::test]
    async fn ids_are_distinct_and_registered() {
        let reg = registry(0);
        let a = reg.create().await.unwrap();
        let b = reg.create().await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(reg.count().await, 2);
        assert!(Arc::ptr_eq(&reg.get(a.id()).await.unwrap(), &a));
    }

    #[tokio::test]
    async fn unknown_id_is_never_created() {
        let reg = registry(0);
        assert_eq!(
            reg.get("nope").await.unwrap_err(),
            SessionError::Unknown("nope".into())
        );
        assert_eq!(reg.count().await, 0);
    }

    #[tokio::test]
    async fn closed_id_reports_closed() {
        let reg = registry(0);
        let session = reg.create().await.unwrap();
        let id = session.id().to_string();
        reg.close(&id).await.unwrap();

        assert!(session.is_closed());
        assert_eq!(reg.get(&id).await.unwrap_err(), SessionError::Closed(id.clone()));
        assert_eq!(reg.close(&id).await.unwrap_err(), SessionError::Closed(id.clone()));
        assert_eq!(
            session.handle(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"})).await,
            Err(SessionError::Closed(id))
        );
    }

    #[tokio::test]
    async fn session_debug_shows_state_only() {
        let reg = registry(0);
        let session = reg.create().await.unwrap();
        let rendered = format!("{session:?}");
        assert!(rendered.contains(session.id()));
        assert!(rendered.contains("closed: false"));
        reg.close(session.id()).await.unwrap();
        assert!(format!("{session:?}").contains("closed: true"));
    }

    #[tokio::test]
    async fn limit_is_enforced() {
        let reg = registry(1);
        let first = reg.create().await.unwrap();
        assert_eq!(reg.create().await.unwrap_err(), SessionError::LimitReached(1));
        reg.close(first.id()).await.unwrap();
        assert!(reg.create().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_skips_sessions_with_subscribers() {
        let reg = registry(0);
        let idle = reg.create().await.unwrap();
        let watched = reg.create().await.unwrap();
        let _rx = watched.subscribe();

        tokio::time::advance(Duration::from_secs(120)).await;
        let swept = reg.sweep_idle(Duration::from_secs(60)).await;

        assert_eq!(swept, vec![idle.id().to_string()]);
        assert!(idle.is_closed());
        assert!(!watched.is_closed());
        assert_eq!(reg.count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_keeps_recent_sessions() {
        let reg = registry(0);
        let session = reg.create().await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(reg.sweep_idle(Duration::from_secs(60)).await.is_empty());
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn close_all_retires_everything() {
        let reg = registry(0);
        let a = reg.create().await.unwrap();
        let b = reg.create().await.unwrap();
        assert_eq!(reg.close_all().await, 2);
        assert_eq!(reg.count().await, 0);
        assert!(a.is_closed() && b.is_closed());
        assert!(matches!(reg.get(a.id()).await, Err(SessionError::Closed(_))));
    }

    #[tokio::test]
    async fn requests_in_one_session_run_in_order() {
        let reg = registry(0);
        let session = reg.create().await.unwrap();
        session
            .handle(json!({"jsonrpc": "2.0", "id": 0, "method": "initialize", "params": {}}))
            .await
            .unwrap();

        let responses = session
            .handle_all(vec![
                json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}),
                json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
                json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
            ])
            .await
            .unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["id"], 1);
        assert_eq!(responses[1]["id"], 2);
    }
}
