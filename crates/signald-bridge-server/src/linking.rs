//! Device linking handshake.
//!
//! A session walks `Idle -> AwaitingUri -> AwaitingConfirmation -> Done`.
//! It owns a dedicated daemon connection for its whole lifetime: the first
//! `link` reply carries a one-time URI that is shown to the user as a QR
//! code, and the confirmation only arrives after the new device has
//! scanned it, so the second phase runs in a background task.

use std::io::Cursor;
use std::path::PathBuf;
use std::time::Duration;

use image::{ImageBuffer, ImageFormat, Luma};
use qrcode::{Color, EcLevel, QrCode};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use signald_bridge_net::{DaemonClient, NetError};
use signald_bridge_shared::constants::QR_CODE_SIZE;
use signald_bridge_shared::RequestId;

use crate::error::ServerError;

#[derive(Debug, Clone, PartialEq)]
pub enum LinkState {
    Idle,
    AwaitingUri,
    AwaitingConfirmation { request_id: RequestId },
    Done,
}

pub struct LinkingSession {
    device_name: String,
    client: DaemonClient,
    confirm_timeout: Duration,
    state: LinkState,
}

impl LinkingSession {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        device_name: &str,
        request_timeout: Duration,
        confirm_timeout: Duration,
    ) -> Result<Self, ServerError> {
        if device_name.trim().is_empty() {
            return Err(ServerError::Validation(
                "Please provide a name for the device".into(),
            ));
        }

        Ok(Self {
            device_name: device_name.to_string(),
            client: DaemonClient::new(socket_path, request_timeout),
            confirm_timeout,
            state: LinkState::Idle,
        })
    }

    pub fn state(&self) -> &LinkState {
        &self.state
    }

    /// Obtain the linking URI and render it as a PNG QR code.
    ///
    /// On any failure the session's connection is closed and the session
    /// is finished.
    pub async fn start(&mut self) -> Result<Vec<u8>, ServerError> {
        if self.state != LinkState::Idle {
            return Err(ServerError::Internal(
                "Linking session already started".into(),
            ));
        }
        self.state = LinkState::AwaitingUri;

        match self.request_uri().await {
            Ok((request_id, png)) => {
                self.state = LinkState::AwaitingConfirmation { request_id };
                Ok(png)
            }
            Err(e) => {
                self.finish().await;
                Err(e)
            }
        }
    }

    async fn request_uri(&self) -> Result<(RequestId, Vec<u8>), ServerError> {
        self.client.transport().connect().await?;

        let (request_id, frame) = self
            .client
            .link(&self.device_name, None, self.client.request_timeout())
            .await?;
        let uri = frame.linking_uri().ok_or_else(|| {
            ServerError::Protocol(format!("'{}' reply carries no linking URI", frame.kind))
        })?;

        info!(device = %self.device_name, id = %request_id, "Received linking URI");
        let png = render_qr_png(uri)?;
        Ok((request_id, png))
    }

    /// Wait for the new device in the background. The outcome is only
    /// logged, and the connection is closed once it is known.
    pub fn spawn_confirmation(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut session = self;
            if let Err(e) = session.await_confirmation().await {
                warn!(device = %session.device_name, error = %e, "Device linking failed");
            }
            session.finish().await;
        })
    }

    async fn await_confirmation(&mut self) -> Result<(), NetError> {
        let LinkState::AwaitingConfirmation { request_id } = &self.state else {
            return Ok(());
        };

        let (_, frame) = self
            .client
            .link(
                &self.device_name,
                Some(request_id.clone()),
                self.confirm_timeout,
            )
            .await?;

        info!(device = %self.device_name, outcome = %frame.kind, "Device linking finished");
        Ok(())
    }

    async fn finish(&mut self) {
        self.client.transport().disconnect().await;
        self.state = LinkState::Done;
    }
}

/// Render `data` as a borderless square PNG QR code at medium error
/// correction.
pub fn render_qr_png(data: &str) -> Result<Vec<u8>, ServerError> {
    let code = QrCode::with_error_correction_level(data, EcLevel::M)
        .map_err(|e| ServerError::Qr(e.to_string()))?;
    let colors = code.to_colors();
    let modules = code.width() as u32;

    let image = ImageBuffer::from_fn(QR_CODE_SIZE, QR_CODE_SIZE, |x, y| {
        let mx = (x * modules / QR_CODE_SIZE) as usize;
        let my = (y * modules / QR_CODE_SIZE) as usize;
        match colors[my * modules as usize + mx] {
            Color::Dark => Luma([0u8]),
            Color::Light => Luma([255u8]),
        }
    });

    let mut png = Cursor::new(Vec::new());
    image
        .write_to(&mut png, ImageFormat::Png)
        .map_err(|e| ServerError::Qr(e.to_string()))?;
    Ok(png.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use signald_bridge_net::testing::{error_reply, reply, FakeDaemon};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    const URI: &str = "tsdevice:/?uuid=abc&pub_key=def";

    #[test]
    fn test_qr_is_256_square_png() {
        let png = render_qr_png(URI).unwrap();
        let image = image::load_from_memory_with_format(&png, ImageFormat::Png)
            .unwrap()
            .to_luma8();
        assert_eq!(image.dimensions(), (256, 256));
        // Borderless: the finder pattern starts in the top-left corner
        assert_eq!(image.get_pixel(0, 0), &Luma([0u8]));
    }

    #[test]
    fn test_empty_device_name_rejected() {
        let result = LinkingSession::new(
            "/nonexistent.sock",
            "  ",
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(ServerError::Validation(_))));
    }

    #[tokio::test]
    async fn test_full_handshake() {
        let uri_sent = Arc::new(AtomicBool::new(false));
        let daemon = FakeDaemon::start(move |req| {
            if uri_sent.swap(true, Ordering::SeqCst) {
                vec![reply(req, "linking_successful", json!({"number": "+1"}))]
            } else {
                vec![reply(req, "linking_uri", json!({"uri": URI}))]
            }
        })
        .await;
        let mut session = LinkingSession::new(
            daemon.socket_path(),
            "laptop",
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .unwrap();

        let png = session.start().await.unwrap();
        assert!(png.starts_with(b"\x89PNG"));
        let LinkState::AwaitingConfirmation { request_id } = session.state().clone() else {
            panic!("unexpected state {:?}", session.state());
        };

        session.spawn_confirmation().await.unwrap();

        let received = daemon.received().await;
        assert_eq!(received.len(), 2);
        assert_eq!(received[0]["type"], "link");
        assert_eq!(received[0]["deviceName"], "laptop");
        assert_eq!(received[1]["id"], request_id.as_str());
    }

    #[tokio::test]
    async fn test_daemon_error_finishes_session() {
        let daemon = FakeDaemon::start(|req| vec![error_reply(req, "Linking not possible")]).await;
        let mut session = LinkingSession::new(
            daemon.socket_path(),
            "laptop",
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .unwrap();

        match session.start().await {
            Err(ServerError::Daemon(detail)) => assert_eq!(detail, "Linking not possible"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(session.state(), &LinkState::Done);
        assert!(!session.client.transport().is_connected().await);
    }

    #[tokio::test]
    async fn test_unreachable_daemon() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut session = LinkingSession::new(
            dir.path().join("missing.sock"),
            "laptop",
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .unwrap();

        assert!(matches!(
            session.start().await,
            Err(ServerError::Transport(_))
        ));
        assert_eq!(session.state(), &LinkState::Done);
    }
}
