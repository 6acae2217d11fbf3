use std::time::Duration;

use thiserror::Error;

use signald_bridge_shared::ProtocolError;

/// Errors produced while talking to the daemon.
#[derive(Error, Debug)]
pub enum NetError {
    /// Socket connect, write or read failure, or the connection went away
    /// while a caller was waiting on it.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The daemon answered with a frame that could not be decoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The daemon rejected the command; the detail is its own wording.
    #[error("{0}")]
    Daemon(String),

    #[error("Timed out after {}s waiting for the daemon", .0.as_secs())]
    Timeout(Duration),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, NetError>;
