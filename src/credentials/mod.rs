//! Shared OAuth2 client-credentials token cache.
//!
//! [`CredentialCache`] is the single owner of the upstream access token and
//! of the base URL it was issued against. Every session goes through
//! [`CredentialCache::get_token`]; the endpoint can only move through
//! [`CredentialCache::set_endpoint`].
//!
//! ## Endpoint resolution
//!
//! - **Explicit** (configured, pinned, or learned): token requests go to that
//!   one endpoint. A failure is surfaced as-is, other regions are not tried.
//! - **Unresolved**: candidates are tried in order. The first one that issues
//!   a token becomes the explicit endpoint for the rest of the process.
//!
//! ## Concurrency
//!
//! Token, endpoint and the in-flight acquisition live behind one mutex that
//! is never held across an `.await`. Callers that find no usable token join
//! the in-flight acquisition (a [`Shared`] future) instead of starting their
//! own, so a burst of sessions at expiry produces one token request per
//! candidate. The acquisition runs on its own task, so it completes and
//! commits its result under the same mutex even if every waiter goes away.
//! A generation counter bumped by `set_endpoint` makes results of a
//! superseded acquisition get dropped instead of committed.

pub mod region;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Deserialize;
use tracing::{debug, info, warn};

pub use region::{EndpointPolicy, Region};

use crate::config::UpstreamConfig;

/// Path of the client-credentials token endpoint, relative to the base URL.
pub const TOKEN_PATH: &str = "/ws/oauth/token";

/// Tokens are refreshed this long before their reported expiry.
pub const REFRESH_SKEW_MS: u64 = 5 * 60 * 1000;

/// Lifetime assumed when the token response omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

/// Longest slice of a failed token response kept for diagnostics.
const MAX_REASON_BODY: usize = 200;

/// Errors produced by the credential cache.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CredentialError {
    /// No client id / secret configured. Nothing will succeed until fixed.
    #[error("upstream credentials are not configured (set NINJA_CLIENT_ID and NINJA_CLIENT_SECRET)")]
    NotConfigured,
    /// Every endpoint that was tried refused or failed to issue a token.
    #[error("token acquisition failed: {}", describe_attempts(.attempts))]
    Acquisition { attempts: Vec<EndpointAttempt> },
    /// `set_endpoint` target failed the allow-list.
    #[error("endpoint rejected: {0}")]
    EndpointRejected(String),
}

/// One failed token request, for diagnostics. Never contains the secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAttempt {
    pub endpoint: String,
    pub reason: String,
}

fn describe_attempts(attempts: &[EndpointAttempt]) -> String {
    if attempts.is_empty() {
        return "no endpoints to try".to_string();
    }
    attempts
        .iter()
        .map(|a| format!("{} ({})", a.endpoint, a.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Client id and secret, fixed for the process lifetime.
#[derive(Clone)]
pub struct CredentialSet {
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSet")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// The base URL token requests go to, and whether it is pinned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    /// Current base URL. When not explicit this is only the first candidate.
    pub base_url: String,
    pub explicit: bool,
}

/// A bearer token together with the endpoint that issued it.
#[derive(Clone)]
pub struct TokenRecord {
    pub access_token: String,
    pub expires_at_ms: u64,
    pub base_url: String,
}

impl TokenRecord {
    /// Usable while `now < expires_at - skew`.
    pub fn is_usable(&self, now_ms: u64) -> bool {
        now_ms.saturating_add(REFRESH_SKEW_MS) < self.expires_at_ms
    }
}

impl fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRecord")
            .field("access_token", &"<redacted>")
            .field("expires_at_ms", &self.expires_at_ms)
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Read-only view of the cache for health output and the region tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSnapshot {
    pub configured: bool,
    pub endpoint: ResolvedEndpoint,
    pub token_cached: bool,
    pub token_expires_at_ms: Option<u64>,
}

/// Everything needed to build a [`CredentialCache`].
pub struct CacheSettings {
    pub credentials: Option<CredentialSet>,
    pub policy: EndpointPolicy,
    /// Auto-detection order. Empty means the policy's region order.
    pub candidates: Vec<String>,
    /// Initial explicit endpoint (from configuration), already resolved.
    pub explicit_endpoint: Option<String>,
    pub scope: String,
    pub token_timeout: Duration,
    pub http: reqwest::Client,
}

impl CacheSettings {
    /// Settings from the `[upstream]` section.
    ///
    /// `base_url` wins over `region`; either one pins the endpoint at startup.
    /// A configured `base_url` is operator input and skips the allow-list, a
    /// `region` must name a known region.
    pub fn from_config(
        config: &UpstreamConfig,
        http: reqwest::Client,
    ) -> Result<Self, CredentialError> {
        let policy = EndpointPolicy::with_default_regions(config.allowed_domain.as_str());
        let explicit_endpoint = match (&config.base_url, &config.region) {
            (Some(url), _) => Some(url.trim().trim_end_matches('/').to_string()),
            (None, Some(key)) => Some(
                policy
                    .region(key)
                    .map(|r| r.base_url.clone())
                    .ok_or_else(|| {
                        CredentialError::EndpointRejected(format!("unknown region '{key}'"))
                    })?,
            ),
            (None, None) => None,
        };
        let credentials = config.credentials().map(|(id, secret)| CredentialSet {
            client_id: id.to_string(),
            client_secret: secret.to_string(),
        });
        Ok(Self {
            credentials,
            policy,
            candidates: config.candidates.clone(),
            explicit_endpoint,
            scope: config.scope.clone(),
            token_timeout: Duration::from_secs(config.token_timeout_secs),
            http,
        })
    }
}

#[derive(Deserialize)]
struct TokenGrant {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

type Acquisition = Shared<BoxFuture<'static, Result<TokenRecord, CredentialError>>>;

struct InFlight {
    generation: u64,
    future: Acquisition,
}

struct CacheState {
    endpoint: ResolvedEndpoint,
    token: Option<TokenRecord>,
    generation: u64,
    in_flight: Option<InFlight>,
}

/// Process-wide token cache shared by every session.
pub struct CredentialCache {
    credentials: Option<Arc<CredentialSet>>,
    policy: EndpointPolicy,
    candidates: Vec<String>,
    scope: String,
    token_timeout: Duration,
    http: reqwest::Client,
    state: Arc<Mutex<CacheState>>,
}

impl CredentialCache {
    pub fn new(settings: CacheSettings) -> Self {
        let candidates = if settings.candidates.is_empty() {
            settings.policy.default_candidates()
        } else {
            settings
                .candidates
                .iter()
                .map(|c| c.trim_end_matches('/').to_string())
                .collect()
        };
        let endpoint = match settings.explicit_endpoint {
            Some(url) => ResolvedEndpoint {
                base_url: url.trim_end_matches('/').to_string(),
                explicit: true,
            },
            None => ResolvedEndpoint {
                base_url: candidates.first().cloned().unwrap_or_default(),
                explicit: false,
            },
        };
        if settings.credentials.is_none() {
            warn!("Upstream credentials not configured; every tool call will fail");
        }
        Self {
            credentials: settings.credentials.map(Arc::new),
            policy: settings.policy,
            candidates,
            scope: settings.scope,
            token_timeout: settings.token_timeout,
            http: settings.http,
            state: Arc::new(Mutex::new(CacheState {
                endpoint,
                token: None,
                generation: 0,
                in_flight: None,
            })),
        }
    }

    /// Whether credentials are present.
    pub fn is_configured(&self) -> bool {
        self.credentials.is_some()
    }

    /// The allow-list used by [`set_endpoint`](Self::set_endpoint).
    pub fn policy(&self) -> &EndpointPolicy {
        &self.policy
    }

    /// Auto-detection order.
    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    /// Return a usable bearer token, acquiring one if needed.
    ///
    /// Concurrent callers share a single acquisition.
    pub async fn get_token(&self) -> Result<TokenRecord, CredentialError> {
        let credentials = self
            .credentials
            .clone()
            .ok_or(CredentialError::NotConfigured)?;

        let acquisition = {
            let mut state = self.lock_state();
            if let Some(token) = state.token.as_ref().filter(|t| t.is_usable(now_ms())) {
                return Ok(token.clone());
            }
            let joinable = state
                .in_flight
                .as_ref()
                .filter(|flight| flight.generation == state.generation)
                .map(|flight| flight.future.clone());
            match joinable {
                Some(future) => future,
                None => {
                    let future = self.start_acquisition(credentials, &state);
                    state.in_flight = Some(InFlight {
                        generation: state.generation,
                        future: future.clone(),
                    });
                    future
                }
            }
        };

        acquisition.await
    }

    /// Pin the endpoint to a region key or allow-listed URL.
    ///
    /// Drops the cached token and detaches any acquisition in progress.
    pub fn set_endpoint(&self, target: &str) -> Result<ResolvedEndpoint, CredentialError> {
        let base_url = self.policy.resolve(target)?;
        let mut state = self.lock_state();
        state.generation += 1;
        state.token = None;
        state.in_flight = None;
        state.endpoint = ResolvedEndpoint {
            base_url,
            explicit: true,
        };
        info!("Upstream endpoint pinned to {}", state.endpoint.base_url);
        Ok(state.endpoint.clone())
    }

    /// Forget the cached token.
    pub fn invalidate(&self) {
        let mut state = self.lock_state();
        if state.token.take().is_some() {
            debug!("Cached upstream token invalidated");
        }
    }

    /// Forget the cached token only if it is still `access_token`, so a late
    /// rejection of an old token leaves a newer one in place.
    pub fn invalidate_if(&self, access_token: &str) -> bool {
        let mut state = self.lock_state();
        if state
            .token
            .as_ref()
            .is_some_and(|t| t.access_token == access_token)
        {
            state.token = None;
            debug!("Rejected upstream token invalidated");
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        let state = self.lock_state();
        let now = now_ms();
        let usable = state.token.as_ref().filter(|t| t.is_usable(now));
        CacheSnapshot {
            configured: self.is_configured(),
            endpoint: state.endpoint.clone(),
            token_cached: usable.is_some(),
            token_expires_at_ms: usable.map(|t| t.expires_at_ms),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the acquisition and return a shared handle to its outcome.
    /// Called with the state lock held.
    fn start_acquisition(
        &self,
        credentials: Arc<CredentialSet>,
        state: &CacheState,
    ) -> Acquisition {
        let targets = if state.endpoint.explicit {
            vec![state.endpoint.base_url.clone()]
        } else {
            self.candidates.clone()
        };
        let explicit = state.endpoint.explicit;
        let generation = state.generation;
        let shared_state = Arc::clone(&self.state);
        let http = self.http.clone();
        let scope = self.scope.clone();
        let timeout = self.token_timeout;

        let task = tokio::spawn(async move {
            let mut attempts = Vec::new();
            for endpoint in targets {
                debug!("Requesting upstream token from {endpoint}");
                match request_token(&http, &endpoint, &credentials, &scope, timeout).await {
                    Ok(grant) => {
                        let issued_at = now_ms();
                        let lifetime_ms = grant
                            .expires_in
                            .unwrap_or(DEFAULT_EXPIRES_IN_SECS)
                            .saturating_mul(1000);
                        let record = TokenRecord {
                            access_token: grant.access_token,
                            expires_at_ms: issued_at.saturating_add(lifetime_ms),
                            base_url: endpoint,
                        };
                        commit(&shared_state, generation, Some(&record));
                        if !explicit {
                            info!("Region auto-detected: {}", record.base_url);
                        }
                        return Ok(record);
                    }
                    Err(reason) => {
                        warn!("Token request to {endpoint} failed: {reason}");
                        attempts.push(EndpointAttempt { endpoint, reason });
                    }
                }
            }
            commit(&shared_state, generation, None);
            Err(CredentialError::Acquisition { attempts })
        });

        // Waiters only observe the task: it keeps running and commits even
        // when every caller is cancelled.
        let cache_state = Arc::clone(&self.state);
        async move {
            task.await.unwrap_or_else(|e| {
                warn!("Token acquisition task failed: {e}");
                commit(&cache_state, generation, None);
                Err(CredentialError::Acquisition {
                    attempts: vec![EndpointAttempt {
                        endpoint: String::new(),
                        reason: format!("acquisition task failed: {e}"),
                    }],
                })
            })
        }
        .boxed()
        .shared()
    }
}

/// Record the outcome of an acquisition, unless `set_endpoint` superseded it.
fn commit(state: &Mutex<CacheState>, generation: u64, record: Option<&TokenRecord>) {
    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    if state.generation != generation {
        debug!("Discarding token acquisition superseded by an endpoint change");
        return;
    }
    if let Some(record) = record {
        state.token = Some(record.clone());
        state.endpoint = ResolvedEndpoint {
            base_url: record.base_url.clone(),
            explicit: true,
        };
    }
    state.in_flight = None;
}

async fn request_token(
    http: &reqwest::Client,
    base_url: &str,
    credentials: &CredentialSet,
    scope: &str,
    timeout: Duration,
) -> Result<TokenGrant, String> {
    let form = [
        ("grant_type", "client_credentials"),
        ("client_id", credentials.client_id.as_str()),
        ("client_secret", credentials.client_secret.as_str()),
        ("scope", scope),
    ];
    let resp = http
        .post(format!("{base_url}{TOKEN_PATH}"))
        .timeout(timeout)
        .form(&form)
        .send()
        .await
        .map_err(|e| describe_transport_error(e, timeout))?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(format!(
            "HTTP {}: {}",
            status.as_u16(),
            truncate(body.trim(), MAX_REASON_BODY)
        ));
    }

    let grant: TokenGrant = resp
        .json()
        .await
        .map_err(|e| describe_transport_error(e, timeout))?;
    if grant.access_token.is_empty() {
        return Err("token response contained an empty access_token".to_string());
    }
    Ok(grant)
}

fn describe_transport_error(err: reqwest::Error, timeout: Duration) -> String {
    if err.is_timeout() {
        format!("timed out after {}s", timeout.as_secs_f32())
    } else if err.is_connect() {
        "connection failed".to_string()
    } else if err.is_decode() {
        "invalid token response".to_string()
    } else {
        // Strip the URL: it is already reported as the attempt's endpoint.
        err.without_url().to_string()
    }
}

pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
