//! Scripted stand-in for signald, listening on a temporary Unix socket.
//!
//! Every line a client writes is recorded and handed to the script, whose
//! replies are written back in order on the same connection.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// One scripted response.
#[derive(Debug, Clone)]
pub enum FakeReply {
    /// Written verbatim followed by a newline.
    Line(String),
    /// Close this connection.
    HangUp,
}

impl From<Value> for FakeReply {
    fn from(value: Value) -> Self {
        FakeReply::Line(value.to_string())
    }
}

/// A frame answering `request` with the given type and data.
pub fn reply(request: &Value, kind: &str, data: Value) -> FakeReply {
    json!({"id": request["id"], "type": kind, "data": data}).into()
}

/// An error frame answering `request`.
pub fn error_reply(request: &Value, message: &str) -> FakeReply {
    json!({"id": request["id"], "type": "unexpected_error", "data": {"message": message}}).into()
}

type Script = Arc<dyn Fn(&Value) -> Vec<FakeReply> + Send + Sync>;

pub struct FakeDaemon {
    socket_path: PathBuf,
    received: Arc<Mutex<Vec<Value>>>,
    connections: Arc<AtomicUsize>,
    task: JoinHandle<()>,
    _dir: TempDir,
}

impl FakeDaemon {
    pub async fn start<F>(script: F) -> Self
    where
        F: Fn(&Value) -> Vec<FakeReply> + Send + Sync + 'static,
    {
        let dir = TempDir::new().expect("temp dir for fake daemon");
        let socket_path = dir.path().join("signald.sock");
        let listener = UnixListener::bind(&socket_path).expect("bind fake daemon socket");

        let script: Script = Arc::new(script);
        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));

        let task = {
            let received = received.clone();
            let connections = connections.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(stream, script.clone(), received.clone()));
                }
            })
        };

        Self {
            socket_path,
            received,
            connections,
            task,
            _dir: dir,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Every request received so far, across connections, in arrival order.
    pub async fn received(&self) -> Vec<Value> {
        self.received.lock().await.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` requests have arrived.
    pub async fn wait_for_requests(&self, count: usize) {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while self.received.lock().await.len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "fake daemon never saw {count} requests");
    }
}

impl Drop for FakeDaemon {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(stream: UnixStream, script: Script, received: Arc<Mutex<Vec<Value>>>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(request) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        received.lock().await.push(request.clone());

        for response in script(&request) {
            match response {
                FakeReply::Line(mut line) => {
                    line.push('\n');
                    if write_half.write_all(line.as_bytes()).await.is_err() {
                        return;
                    }
                }
                FakeReply::HangUp => return,
            }
        }
    }
}
