#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # gemini-relay
//!
//! Reverse HTTP proxy tunneled over client-side WebSocket connections.
//!
//! An authenticated client (typically a browser extension or headless agent
//! that can reach the upstream API) holds an outbound WebSocket to this
//! server. Upstream HTTP callers send ordinary API requests here; each one is
//! framed, routed over one of the caller's tunnels, fetched on the far side,
//! and the framed response — single-shot or streamed — is assembled back into
//! the HTTP response. The direction of HTTP is effectively inverted: the real
//! fetcher is the WebSocket-attached client.
//!
//! ## API surface
//!
//! | Method | Path          | Auth                       | Description                    |
//! |--------|---------------|----------------------------|--------------------------------|
//! | GET    | `/v1/ws`      | `?auth_token=` query param | Tunnel WebSocket upgrade       |
//! | GET    | `/api/health` | No                         | Liveness + connection counts   |
//! | GET    | `/api/logs`   | No                         | In-memory log buffer snapshot  |
//! | *      | any other     | `x-goog-api-key` / `?key=` | Proxied to the tunneled client |
//!
//! ## Architecture
//!
//! ```text
//! main.rs        — entry point, clap, router setup, graceful shutdown
//! config.rs      — TOML + env-var configuration
//! state.rs       — AppState (registry, pending table, log buffer)
//! auth.rs        — ingress API key + tunnel token validation
//! frame.rs       — the {id, type, payload} message envelope
//! registry.rs    — user id -> tunnels, round-robin selection
//! tunnel.rs      — one tunnel connection, serialized outbound writes
//! pending.rs     — request id -> response sink correlation table
//! ws.rs          — /v1/ws upgrade + per-tunnel read pump
//! proxy/
//!   mod.rs       — ingress handler (fallback route)
//!   assembler.rs — frame sequence -> HTTP response state machine
//!   rewrite.rs   — best-effort request body normalization
//! routes/
//!   health.rs    — GET /api/health
//!   logs.rs      — GET /api/logs
//! ```

mod auth;
mod config;
mod error;
mod frame;
mod logbuf;
mod pending;
mod proxy;
mod registry;
mod routes;
mod state;
mod tunnel;
mod ws;

use axum::routing::get;
use axum::Router;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use config::Config;
use state::AppState;

/// Reverse HTTP proxy tunneled over client-side WebSocket connections.
#[derive(Parser)]
#[command(name = "gemini-relay", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };
    run_server(config_path.as_deref()).await;
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("gemini-relay v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    info!("Upstream base: {}", config.proxy.upstream_base);

    if config.auth.api_key.is_none() {
        warn!("AUTH_API_KEY not set — every proxy request will be rejected");
    }
    if config.auth.tunnel_tokens.is_empty() {
        warn!("No tunnel tokens configured — no client will be able to connect");
    }

    let state = AppState::new(config);

    // Monitoring endpoints are CORS-open so a locally served log viewer can
    // read them from another origin.
    let monitoring = Router::new()
        .route("/api/health", get(routes::health::health))
        .route("/api/logs", get(routes::logs::get_logs))
        .layer(CorsLayer::permissive());

    let app = Router::new()
        .route("/v1/ws", get(ws::ws_upgrade))
        .merge(monitoring)
        .fallback(proxy::handle)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");
    info!(
        "Tunnel endpoint available at ws://{}/v1/ws",
        state.config.server.listen
    );

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    info!("Shutting down...");
}
