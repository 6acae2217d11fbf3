//! Gateway configuration loaded from environment variables.
//!
//! Every setting has a default, so the gateway starts with zero
//! configuration next to a locally running signald.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use signald_bridge_shared::constants::{
    DEFAULT_ATTACHMENT_DIR, DEFAULT_HTTP_PORT, DEFAULT_SOCKET_PATH,
};

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Path of the signald control socket.
    /// Env: `SIGNALD_SOCKET_PATH`
    /// Default: `/var/run/signald/signald.sock`
    pub socket_path: PathBuf,

    /// Directory where decoded attachments are written for the daemon.
    /// It must be readable by signald.
    /// Env: `ATTACHMENT_TMP_DIR`
    /// Default: `/tmp/`
    pub attachment_dir: PathBuf,

    /// Upper bound on any single daemon reply.
    /// Env: `REQUEST_TIMEOUT_SECS`
    /// Default: 30s
    pub request_timeout: Duration,

    /// Default deadline for a receive batch, overridable per call.
    /// Env: `RECEIVE_TIMEOUT_SECS`
    /// Default: 60s
    pub receive_timeout: Duration,

    /// How long a linking session waits for the new device to confirm.
    /// Env: `LINK_TIMEOUT_SECS`
    /// Default: 300s
    pub link_timeout: Duration,

    /// Maximum HTTP request body size in bytes.
    /// Env: `MAX_BODY_BYTES`
    /// Default: 50 MiB
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            attachment_dir: PathBuf::from(DEFAULT_ATTACHMENT_DIR),
            request_timeout: Duration::from_secs(30),
            receive_timeout: Duration::from_secs(60),
            link_timeout: Duration::from_secs(300),
            max_body_bytes: 50 * 1024 * 1024, // 50 MiB
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from any key lookup. Invalid values are
    /// reported and replaced by the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(path) = lookup("SIGNALD_SOCKET_PATH") {
            if !path.is_empty() {
                config.socket_path = PathBuf::from(path);
            }
        }

        if let Some(path) = lookup("ATTACHMENT_TMP_DIR") {
            if !path.is_empty() {
                config.attachment_dir = PathBuf::from(path);
            }
        }

        if let Some(secs) = parse_secs(&lookup, "REQUEST_TIMEOUT_SECS") {
            config.request_timeout = secs;
        }
        if let Some(secs) = parse_secs(&lookup, "RECEIVE_TIMEOUT_SECS") {
            config.receive_timeout = secs;
        }
        if let Some(secs) = parse_secs(&lookup, "LINK_TIMEOUT_SECS") {
            config.link_timeout = secs;
        }

        if let Some(val) = lookup("MAX_BODY_BYTES") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.max_body_bytes = n,
                _ => tracing::warn!(value = %val, "Invalid MAX_BODY_BYTES, using default"),
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

/// Parse a positive number of seconds.
fn parse_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    let val = lookup(key)?;
    match val.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
        _ => {
            tracing::warn!(key, value = %val, "Invalid timeout, using default");
            None
        }
    }
}
