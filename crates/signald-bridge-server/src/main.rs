//! # signald-bridge-server
//!
//! HTTP gateway in front of a signald daemon.
//!
//! This binary provides:
//! - **REST API** (axum) for registration, sending, receiving, groups and
//!   device linking
//! - **Protocol bridge** turning each HTTP call into correlated commands on
//!   signald's Unix socket and waiting for the matching replies
//! - **Attachment handling** that writes base64 payloads to temporary files
//!   the daemon can read, and removes them afterwards

mod accounts;
mod api;
mod attachments;
mod config;
mod dispatcher;
mod error;
mod groups;
mod linking;
mod receive;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,signald_bridge_server=debug,signald_bridge_net=debug")
        }))
        .init();

    info!("Starting signald bridge v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Daemon client. The connection is opened on first use so the
    //    gateway can start before signald does.
    // -----------------------------------------------------------------------
    let http_addr = config.http_addr;
    let app_state = AppState::new(config);

    if let Err(e) = app_state.client.transport().connect().await {
        tracing::warn!(error = %e, "Daemon not reachable yet, will retry on first request");
    }

    // -----------------------------------------------------------------------
    // 4. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    let result = tokio::select! {
        result = api::serve(app_state.clone(), http_addr) => {
            if let Err(e) = &result {
                tracing::error!(error = %e, "HTTP server failed");
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            Ok(())
        }
    };

    app_state.client.transport().disconnect().await;
    result
}
