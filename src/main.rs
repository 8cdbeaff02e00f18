#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # ninjaone-mcp
//!
//! MCP gateway for the NinjaOne RMM API.
//!
//! Many MCP clients share one process: each gets its own session and
//! protocol handler, while a single credential cache owns the OAuth2 token
//! and the auto-detected region for all of them.
//!
//! ## Subcommands
//!
//! - `ninjaone-mcp serve` (default): run the Streamable HTTP gateway
//! - `ninjaone-mcp stdio`: serve one MCP client over stdin/stdout
//!
//! ## API surface
//!
//! | Method | Path      | Auth | Description                           |
//! |--------|-----------|------|---------------------------------------|
//! | GET    | `/health` | No   | Liveness probe                        |
//! | POST   | `/mcp`    | Yes* | JSON-RPC: initialize / send-and-reply |
//! | GET    | `/mcp`    | Yes* | SSE stream of server-pushed messages  |
//! | DELETE | `/mcp`    | Yes* | Close the session                     |
//!
//! *Only when a shared secret is configured; `?token=` or `Authorization: Bearer`.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use ninjaone_mcp::credentials::CacheSettings;
use ninjaone_mcp::upstream::build_http_client;
use ninjaone_mcp::{
    gateway, stdio, AppState, Config, CredentialCache, HandlerContext, SessionRegistry,
    UpstreamClient,
};

/// Multi-session MCP gateway for the NinjaOne RMM API.
#[derive(Parser)]
#[command(name = "ninjaone-mcp", version)]
struct Cli {
    /// Path to TOML config file.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP gateway (default when no subcommand given).
    Serve,
    /// Serve a single MCP client over stdin/stdout.
    Stdio,
}

/// How often idle sessions are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ninjaone-mcp: {e}");
            std::process::exit(2);
        }
    };

    let stdio_mode = matches!(cli.command, Some(Commands::Stdio));
    init_tracing(&config, stdio_mode);

    let (credentials, ctx) = match build_context(&config) {
        Ok(parts) => parts,
        Err(e) => {
            error!("{e}");
            std::process::exit(2);
        }
    };

    if stdio_mode {
        info!("ninjaone-mcp v{} serving stdio", env!("CARGO_PKG_VERSION"));
        stdio::run_stdio(ctx).await;
    } else {
        run_server(config, credentials, ctx).await;
    }
}

/// `RUST_LOG` wins over `logging.level`. In stdio mode stdout carries
/// protocol frames only, so logs go to stderr.
fn init_tracing(config: &Config, stdio_mode: bool) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    let builder = tracing_subscriber::fmt().with_env_filter(log_filter);
    if stdio_mode {
        builder.with_writer(std::io::stderr).init();
    } else {
        builder.init();
    }
}

fn build_context(
    config: &Config,
) -> Result<(Arc<CredentialCache>, HandlerContext), Box<dyn std::error::Error>> {
    let http = build_http_client()?;
    let settings = CacheSettings::from_config(&config.upstream, http.clone())?;
    let credentials = Arc::new(CredentialCache::new(settings));
    let upstream = UpstreamClient::new(
        http,
        Arc::clone(&credentials),
        Duration::from_secs(config.upstream.request_timeout_secs),
    );

    let endpoint = credentials.snapshot().endpoint;
    if endpoint.explicit {
        info!("Upstream endpoint: {}", endpoint.base_url);
    } else {
        info!(
            "Upstream endpoint not set; will auto-detect from {} candidates",
            credentials.candidates().len()
        );
    }
    Ok((credentials, HandlerContext::new(Arc::new(upstream))))
}

async fn run_server(config: Config, credentials: Arc<CredentialCache>, ctx: HandlerContext) {
    info!("ninjaone-mcp v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    if config.auth.shared_secret.is_none() {
        warn!("No shared secret configured: /mcp is open to anyone who can reach it");
    }

    let sessions = SessionRegistry::new(ctx, config.server.max_sessions);
    let state = AppState::new(sessions.clone(), credentials);

    let app = gateway::router(state, config.auth.shared_secret.clone())
        .layer(ConcurrencyLimitLayer::new(config.server.max_connections))
        .layer(TraceLayer::new_for_http());

    let listener = match TcpListener::bind(&config.server.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {e}", config.server.listen);
            std::process::exit(1);
        }
    };

    // Periodic sweep: close sessions idle past the configured timeout
    let idle_timeout = config.server.session_idle_timeout_secs;
    let sweep_task = (idle_timeout > 0).then(|| {
        let sessions = sessions.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                interval.tick().await;
                let closed = sessions
                    .sweep_idle(Duration::from_secs(idle_timeout))
                    .await;
                if !closed.is_empty() {
                    info!("Idle sweep closed {} session(s)", closed.len());
                }
            }
        })
    });

    // Graceful shutdown. Sessions are closed as soon as the signal arrives so
    // open SSE streams end and the server can drain.
    let shutdown_sessions = sessions.clone();
    let shutdown = async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => info!("Received SIGINT"),
                        _ = sigterm.recv() => info!("Received SIGTERM"),
                    }
                }
                Err(e) => {
                    warn!("Failed to register SIGTERM handler: {e}");
                    ctrl_c.await.ok();
                    info!("Received SIGINT");
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
        let closed = shutdown_sessions.close_all().await;
        info!("Closed {closed} session(s)");
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!("Server error: {e}");
    }

    // Cleanup
    info!("Shutting down...");
    if let Some(task) = sweep_task {
        task.abort();
    }
    info!("Goodbye");
}
