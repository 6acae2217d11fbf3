use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use signald_bridge_shared::{Command, DaemonFrame, Request, RequestId};

use crate::error::{NetError, Result};
use crate::transport::ConnectionCommand;

/// A live receive stream for one number.
///
/// Frames arrive in the order the connection read them. Dropping the handle
/// stops forwarding; the daemon is told to unsubscribe once no other handle
/// for the same number is left. The connection itself stays open.
pub struct Subscription {
    id: RequestId,
    number: String,
    frames: mpsc::UnboundedReceiver<DaemonFrame>,
    cmd_tx: mpsc::Sender<ConnectionCommand>,
}

impl Subscription {
    pub(crate) fn new(
        id: RequestId,
        number: &str,
        frames: mpsc::UnboundedReceiver<DaemonFrame>,
        cmd_tx: mpsc::Sender<ConnectionCommand>,
    ) -> Self {
        Self {
            id,
            number: number.to_string(),
            frames,
            cmd_tx,
        }
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn number(&self) -> &str {
        &self.number
    }

    /// Next frame, or `None` once the connection has gone away.
    pub async fn next_frame(&mut self) -> Option<DaemonFrame> {
        self.frames.recv().await
    }

    /// Collect frames until one is marked done, returning all of them with
    /// the sentinel last. Fails with [`NetError::Timeout`] when `deadline`
    /// passes first, and with [`NetError::Daemon`] as soon as the daemon
    /// rejects the subscribe itself.
    pub async fn collect_batch(&mut self, deadline: Duration) -> Result<Vec<DaemonFrame>> {
        let mut batch = Vec::new();
        let id = &self.id;
        let frames = &mut self.frames;

        let collected = tokio::time::timeout(deadline, async {
            while let Some(frame) = frames.recv().await {
                if frame.id.as_ref() == Some(id) && frame.is_error() {
                    return Err(NetError::Daemon(frame.error_detail()));
                }
                let done = frame.done;
                batch.push(frame);
                if done {
                    return Ok(());
                }
            }
            Err(NetError::Transport(
                "Connection to daemon closed during receive".into(),
            ))
        })
        .await;

        match collected {
            Ok(Ok(())) => {
                debug!(number = %self.number, frames = batch.len(), "Receive batch complete");
                Ok(batch)
            }
            Ok(Err(e)) => {
                debug!(number = %self.number, error = %e, "Receive ended early");
                Err(e)
            }
            Err(_) => {
                warn!(
                    number = %self.number,
                    frames = batch.len(),
                    "Receive deadline passed before the batch completed"
                );
                Err(NetError::Timeout(deadline))
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let line = Request::new(Command::Unsubscribe {
            username: self.number.clone(),
        })
        .to_line()
        .ok();

        let command = ConnectionCommand::Unsubscribe {
            id: self.id.clone(),
            number: self.number.clone(),
            line,
        };
        if self.cmd_tx.try_send(command).is_err() {
            debug!(id = %self.id, "Connection gone before unsubscribe");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{error_reply, reply, FakeDaemon, FakeReply};
    use crate::transport::Transport;
    use serde_json::json;

    fn stream_frame(number: &str, n: u32, done: bool) -> FakeReply {
        FakeReply::Line(
            json!({"type": "message", "data": {"username": number, "n": n}, "done": done})
                .to_string(),
        )
    }

    fn subscribe_request(number: &str) -> Request {
        Request::new(Command::Subscribe {
            username: number.into(),
        })
    }

    #[tokio::test]
    async fn test_collect_batch_stops_at_sentinel() {
        let daemon = FakeDaemon::start(|req| {
            if req["type"] != "subscribe" {
                return vec![];
            }
            vec![
                reply(req, "subscribed", json!({})),
                stream_frame("+1", 1, false),
                stream_frame("+2", 99, false),
                stream_frame("+1", 2, false),
                stream_frame("+1", 3, true),
                stream_frame("+1", 4, false),
            ]
        })
        .await;
        let transport = Transport::new(daemon.socket_path());
        transport.connect().await.unwrap();

        let mut subscription = transport
            .subscribe(subscribe_request("+1"), "+1")
            .await
            .unwrap();
        let batch = subscription
            .collect_batch(Duration::from_secs(5))
            .await
            .unwrap();

        let kinds: Vec<_> = batch.iter().map(|f| f.kind.as_str()).collect();
        assert_eq!(kinds, ["subscribed", "message", "message", "message"]);
        let numbers: Vec<_> = batch[1..].iter().map(|f| f.data["n"].as_u64().unwrap()).collect();
        assert_eq!(numbers, [1, 2, 3]);
        assert!(batch.last().unwrap().done);
    }

    #[tokio::test]
    async fn test_drop_unsubscribes_and_keeps_connection() {
        let daemon = FakeDaemon::start(|req| match req["type"].as_str() {
            Some("subscribe") => vec![stream_frame("+1", 1, true)],
            _ => vec![],
        })
        .await;
        let transport = Transport::new(daemon.socket_path());
        transport.connect().await.unwrap();

        let mut subscription = transport
            .subscribe(subscribe_request("+1"), "+1")
            .await
            .unwrap();
        subscription
            .collect_batch(Duration::from_secs(5))
            .await
            .unwrap();
        drop(subscription);

        daemon.wait_for_requests(2).await;
        let received = daemon.received().await;
        assert_eq!(received[1]["type"], "unsubscribe");
        assert_eq!(received[1]["username"], "+1");
        assert!(transport.is_connected().await);
    }

    #[tokio::test]
    async fn test_collect_batch_times_out() {
        let daemon = FakeDaemon::start(|req| match req["type"].as_str() {
            Some("subscribe") => vec![stream_frame("+1", 1, false)],
            _ => vec![],
        })
        .await;
        let transport = Transport::new(daemon.socket_path());
        transport.connect().await.unwrap();

        let mut subscription = transport
            .subscribe(subscribe_request("+1"), "+1")
            .await
            .unwrap();
        let result = subscription.collect_batch(Duration::from_millis(100)).await;
        assert!(matches!(result, Err(NetError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_collect_batch_fails_when_connection_closes() {
        let daemon = FakeDaemon::start(|req| match req["type"].as_str() {
            Some("subscribe") => vec![stream_frame("+1", 1, false), FakeReply::HangUp],
            _ => vec![],
        })
        .await;
        let transport = Transport::new(daemon.socket_path());
        transport.connect().await.unwrap();

        let mut subscription = transport
            .subscribe(subscribe_request("+1"), "+1")
            .await
            .unwrap();
        let result = subscription.collect_batch(Duration::from_secs(5)).await;
        assert!(matches!(result, Err(NetError::Transport(_))));
    }

    #[tokio::test]
    async fn test_rejected_subscribe_fails_at_once() {
        let daemon = FakeDaemon::start(|req| match req["type"].as_str() {
            Some("subscribe") => vec![
                stream_frame("+1", 1, false),
                error_reply(req, "User is not registered"),
            ],
            _ => vec![],
        })
        .await;
        let transport = Transport::new(daemon.socket_path());
        transport.connect().await.unwrap();

        let mut subscription = transport
            .subscribe(subscribe_request("+1"), "+1")
            .await
            .unwrap();
        let started = std::time::Instant::now();
        let result = subscription.collect_batch(Duration::from_secs(5)).await;

        match result {
            Err(NetError::Daemon(detail)) => assert_eq!(detail, "User is not registered"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_overlapping_subscriptions_unsubscribe_once() {
        let daemon = FakeDaemon::start(|req| match req["type"].as_str() {
            Some("subscribe") => vec![reply(req, "subscribed", json!({}))],
            Some("list_groups") => vec![reply(req, "group_list", json!({"groups": []}))],
            _ => vec![],
        })
        .await;
        let transport = Transport::new(daemon.socket_path());
        transport.connect().await.unwrap();

        let first = transport
            .subscribe(subscribe_request("+1"), "+1")
            .await
            .unwrap();
        let mut second = transport
            .subscribe(subscribe_request("+1"), "+1")
            .await
            .unwrap();
        drop(first);

        // Commands are handled in order, so once this reply is back the
        // release of the first handle has been processed too.
        transport
            .request(
                Request::new(Command::ListGroups {
                    username: "+1".into(),
                }),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        let types: Vec<_> = daemon
            .received()
            .await
            .iter()
            .map(|r| r["type"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(types, ["subscribe", "subscribe", "list_groups"]);

        // The remaining handle still gets frames for its number.
        assert_eq!(second.next_frame().await.unwrap().kind, "subscribed");

        drop(second);
        daemon.wait_for_requests(4).await;
        let received = daemon.received().await;
        assert_eq!(received.len(), 4);
        assert_eq!(received[3]["type"], "unsubscribe");
        assert_eq!(received[3]["username"], "+1");
        assert!(transport.is_connected().await);
    }
}
