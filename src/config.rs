//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `NINJA_CLIENT_ID`, `NINJA_CLIENT_SECRET`,
//!    `NINJA_BASE_URL`, `NINJA_REGION`, `NINJA_CANDIDATE_URLS`,
//!    `MCP_AUTH_TOKEN`, `MCP_LISTEN`
//! 2. **Config file**: path via `--config <path>`, or `ninjaone-mcp.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "127.0.0.1:3000"
//! max_sessions = 100
//! session_idle_timeout_secs = 1800   # 0 = never sweep idle sessions
//! max_connections = 256
//!
//! [auth]
//! shared_secret = "your-secret"      # omit to disable the check
//!
//! [upstream]
//! client_id = "..."
//! client_secret = "..."
//! region = "eu"                      # or base_url = "https://eu.ninjarmm.com"
//! candidates = ["https://app.ninjarmm.com", "https://eu.ninjarmm.com"]
//! allowed_domain = "ninjarmm.com"
//! scope = "monitoring management control"
//! token_timeout_secs = 10
//! request_timeout_secs = 30
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;

use serde::Deserialize;

/// Default file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "ninjaone-mcp.toml";

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener and session limits.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `127.0.0.1:3000`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum concurrently open MCP sessions (default 100).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Seconds without traffic before a session is closed by the sweep
    /// (default 1800). 0 disables the sweep.
    #[serde(default = "default_session_idle_timeout")]
    pub session_idle_timeout_secs: u64,
    /// Maximum in-flight HTTP requests (default 256).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Inbound authorization.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Shared secret expected as `?token=` or a Bearer header. Override with
    /// `MCP_AUTH_TOKEN`. `None` disables the check.
    #[serde(default)]
    pub shared_secret: Option<String>,
}

/// Upstream API credentials and endpoint selection.
#[derive(Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Explicit base URL. Wins over `region`.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Region key (`us`, `eu`, `oc`, `ca`, `us2`).
    #[serde(default)]
    pub region: Option<String>,
    /// Auto-detection order. Empty means the built-in region order.
    #[serde(default)]
    pub candidates: Vec<String>,
    /// Hosts under this domain may be pinned at runtime.
    #[serde(default = "default_allowed_domain")]
    pub allowed_domain: String,
    /// OAuth2 scope requested with the client-credentials grant.
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default = "default_token_timeout")]
    pub token_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "127.0.0.1:3000".to_string()
}
fn default_max_sessions() -> usize {
    100
}
fn default_session_idle_timeout() -> u64 {
    1800
}
fn default_max_connections() -> usize {
    256
}
fn default_allowed_domain() -> String {
    "ninjarmm.com".to_string()
}
fn default_scope() -> String {
    "monitoring management control".to_string()
}
fn default_token_timeout() -> u64 {
    10
}
fn default_request_timeout() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_sessions: default_max_sessions(),
            session_idle_timeout_secs: default_session_idle_timeout(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            base_url: None,
            region: None,
            candidates: Vec::new(),
            allowed_domain: default_allowed_domain(),
            scope: default_scope(),
            token_timeout_secs: default_token_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Hand-written so the client secret never lands in logs.
impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &self.client_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("base_url", &self.base_url)
            .field("region", &self.region)
            .field("candidates", &self.candidates)
            .field("allowed_domain", &self.allowed_domain)
            .field("scope", &self.scope)
            .field("token_timeout_secs", &self.token_timeout_secs)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl UpstreamConfig {
    /// `(client_id, client_secret)` when both are present and non-empty.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        let id = self.client_id.as_deref().filter(|s| !s.trim().is_empty())?;
        let secret = self
            .client_secret
            .as_deref()
            .filter(|s| !s.trim().is_empty())?;
        Some((id, secret))
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `ninjaone-mcp.toml`
    /// in the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(DEFAULT_CONFIG_FILE)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Parse a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply environment overrides through `lookup` (injected for tests).
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(id) = lookup("NINJA_CLIENT_ID") {
            self.upstream.client_id = Some(id);
        }
        if let Some(secret) = lookup("NINJA_CLIENT_SECRET") {
            self.upstream.client_secret = Some(secret);
        }
        if let Some(url) = lookup("NINJA_BASE_URL").filter(|s| !s.is_empty()) {
            self.upstream.base_url = Some(url);
        }
        if let Some(region) = lookup("NINJA_REGION").filter(|s| !s.is_empty()) {
            self.upstream.region = Some(region);
        }
        if let Some(list) = lookup("NINJA_CANDIDATE_URLS") {
            let candidates: Vec<String> = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect();
            if !candidates.is_empty() {
                self.upstream.candidates = candidates;
            }
        }
        if let Some(secret) = lookup("MCP_AUTH_TOKEN") {
            self.auth.shared_secret = Some(secret);
        }
        if let Some(listen) = lookup("MCP_LISTEN") {
            self.server.listen = listen;
        }
        if self
            .auth
            .shared_secret
            .as_deref()
            .is_some_and(|s| s.is_empty())
        {
            self.auth.shared_secret = None;
        }
    }
}
