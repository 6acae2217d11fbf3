use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

use signald_bridge_net::NetError;
use signald_bridge_shared::GroupIdError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    InvalidAttachment(String),

    #[error("Invalid group id")]
    InvalidGroupId(#[from] GroupIdError),

    /// Rejected by the daemon; the message is its own.
    #[error("{0}")]
    Daemon(String),

    #[error("Daemon unreachable: {0}")]
    Transport(String),

    #[error("Unexpected reply from daemon: {0}")]
    Protocol(String),

    #[error("Timed out after {}s waiting for the daemon", .0.as_secs())]
    Timeout(Duration),

    #[error("QR code generation failed: {0}")]
    Qr(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::Validation(_)
            | ServerError::InvalidAttachment(_)
            | ServerError::InvalidGroupId(_)
            | ServerError::Daemon(_) => StatusCode::BAD_REQUEST,
            ServerError::Transport(_) | ServerError::Protocol(_) => StatusCode::BAD_GATEWAY,
            ServerError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ServerError::Qr(_) | ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<NetError> for ServerError {
    fn from(e: NetError) -> Self {
        match e {
            NetError::Transport(msg) => ServerError::Transport(msg),
            NetError::Protocol(e) => ServerError::Protocol(e.reason),
            NetError::Daemon(detail) => ServerError::Daemon(detail),
            NetError::Timeout(after) => ServerError::Timeout(after),
            NetError::Serialization(e) => ServerError::Internal(e.to_string()),
        }
    }
}

/// JSON body of every failed call.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    #[schema(example = "Please provide a number")]
    pub error: String,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ServerError::Internal(detail) => {
                tracing::error!(error = %detail, "Internal error");
                "Internal server error".to_string()
            }
            ServerError::InvalidGroupId(source) => {
                tracing::debug!(error = %source, "Rejected group id");
                self.to_string()
            }
            _ => self.to_string(),
        };

        (status, axum::Json(ErrorBody { error: message })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signald_bridge_shared::decode_group_id;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ServerError::Validation("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServerError::from(NetError::Daemon("nope".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServerError::from(NetError::Transport("gone".into())).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ServerError::from(NetError::Timeout(Duration::from_secs(1))).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ServerError::Qr("too long".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_daemon_detail_is_verbatim() {
        let err = ServerError::from(NetError::Daemon("Captcha required".into()));
        assert_eq!(err.to_string(), "Captcha required");
    }

    #[test]
    fn test_group_id_error_converts() {
        let err: ServerError = decode_group_id("group.%%%").unwrap_err().into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "Invalid group id");
    }
}
