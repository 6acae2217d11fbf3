use tracing::info;

use signald_bridge_net::DaemonClient;

use crate::error::ServerError;

pub async fn register(client: &DaemonClient, number: &str, use_voice: bool) -> Result<(), ServerError> {
    if number.is_empty() {
        return Err(ServerError::Validation("Please provide a number".into()));
    }

    client.register(number, use_voice).await?;
    info!(number, use_voice, "Registration started");
    Ok(())
}

pub async fn verify(
    client: &DaemonClient,
    number: &str,
    token: &str,
    pin: Option<&str>,
) -> Result<(), ServerError> {
    if number.is_empty() {
        return Err(ServerError::Validation("Please provide a number".into()));
    }
    if token.is_empty() {
        return Err(ServerError::Validation(
            "Please provide a verification code".into(),
        ));
    }

    client.verify(number, token, pin).await?;
    info!(number, "Number verified");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use signald_bridge_net::testing::{error_reply, reply, FakeDaemon};

    #[tokio::test]
    async fn test_register_and_verify() {
        let daemon = FakeDaemon::start(|req| vec![reply(req, "success", json!({}))]).await;
        let client = DaemonClient::new(daemon.socket_path(), Duration::from_secs(5));

        register(&client, "+1", false).await.unwrap();
        verify(&client, "+1", "123-456", None).await.unwrap();

        let received = daemon.received().await;
        assert_eq!(received[0]["type"], "register");
        assert_eq!(received[0]["voice"], false);
        assert_eq!(received[1]["type"], "verify");
        assert_eq!(received[1]["code"], "123-456");
        assert!(received[1].get("pin").is_none());
    }

    #[tokio::test]
    async fn test_missing_token_sends_nothing() {
        let daemon = FakeDaemon::start(|req| vec![reply(req, "success", json!({}))]).await;
        let client = DaemonClient::new(daemon.socket_path(), Duration::from_secs(5));

        assert!(matches!(
            verify(&client, "+1", "", None).await,
            Err(ServerError::Validation(_))
        ));
        assert!(daemon.received().await.is_empty());
    }

    #[tokio::test]
    async fn test_daemon_rejection_passes_through() {
        let daemon = FakeDaemon::start(|req| vec![error_reply(req, "Invalid verification code")]).await;
        let client = DaemonClient::new(daemon.socket_path(), Duration::from_secs(5));

        match verify(&client, "+1", "000", None).await {
            Err(ServerError::Daemon(detail)) => assert_eq!(detail, "Invalid verification code"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
