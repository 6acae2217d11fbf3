//! Unix socket connection to the daemon.
//!
//! Each open connection runs an event loop in a dedicated tokio task that
//! owns both socket halves and the [`Correlator`]. Callers talk to it
//! through a typed command channel, so writes, reads and routing never
//! contend for a lock. The loop ends on shutdown, on any read or write
//! error, or when the daemon closes the socket; every caller still waiting
//! on the connection is then failed with [`NetError::Transport`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use signald_bridge_shared::constants::COMMAND_QUEUE_DEPTH;
use signald_bridge_shared::{DaemonFrame, Request, RequestId};

use crate::correlator::{Correlator, FrameSender, ReplySender};
use crate::error::{NetError, Result};
use crate::subscription::Subscription;

// ---------------------------------------------------------------------------
// Commands into the connection task
// ---------------------------------------------------------------------------

pub(crate) enum ConnectionCommand {
    /// Write a line and route the reply carrying `id` back.
    Request {
        id: RequestId,
        line: String,
        reply: ReplySender,
    },
    /// Write a line without waiting for any reply.
    Write {
        line: String,
        written: oneshot::Sender<Result<()>>,
    },
    /// Write a subscribe line and forward stream frames.
    Subscribe {
        id: RequestId,
        number: String,
        line: String,
        frames: FrameSender,
        written: oneshot::Sender<Result<()>>,
    },
    /// Stop forwarding to a subscription. `line` is written only when no
    /// other subscription for `number` remains.
    Unsubscribe {
        id: RequestId,
        number: String,
        line: Option<String>,
    },
    /// Forget a waiter that timed out.
    Cancel { id: RequestId },
    Shutdown,
}

struct Connection {
    cmd_tx: mpsc::Sender<ConnectionCommand>,
    task: JoinHandle<()>,
}

impl Connection {
    fn is_open(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

// ---------------------------------------------------------------------------
// Transport handle
// ---------------------------------------------------------------------------

/// Handle to one daemon connection.
///
/// Connect and disconnect are serialized by the inner lock, so they never
/// interleave with a caller picking up the command channel.
pub struct Transport {
    socket_path: PathBuf,
    connection: Mutex<Option<Connection>>,
}

impl Transport {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            connection: Mutex::new(None),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Open the connection. A no-op when already connected.
    pub async fn connect(&self) -> Result<()> {
        let mut guard = self.connection.lock().await;
        if guard.as_ref().is_some_and(Connection::is_open) {
            return Ok(());
        }

        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            NetError::Transport(format!(
                "Failed to connect to {}: {e}",
                self.socket_path.display()
            ))
        })?;

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let task = tokio::spawn(run_connection(stream, cmd_rx));

        info!(path = %self.socket_path.display(), "Connected to daemon");
        *guard = Some(Connection { cmd_tx, task });
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .await
            .as_ref()
            .is_some_and(Connection::is_open)
    }

    /// Close the connection and wait for its task to finish. Safe to call
    /// when never connected.
    pub async fn disconnect(&self) {
        let Some(connection) = self.connection.lock().await.take() else {
            return;
        };

        let _ = connection.cmd_tx.send(ConnectionCommand::Shutdown).await;
        if let Err(e) = connection.task.await {
            warn!(error = %e, "Connection task ended abnormally");
        }
        info!(path = %self.socket_path.display(), "Disconnected from daemon");
    }

    /// Write one command and return the id it was sent with.
    pub async fn send(&self, request: Request) -> Result<RequestId> {
        let line = request.to_line()?;
        let (written, done) = oneshot::channel();
        self.dispatch(ConnectionCommand::Write { line, written })
            .await?;
        await_write(done).await?;
        Ok(request.id)
    }

    /// Write one command and wait up to `timeout` for the frame echoing its
    /// id.
    pub async fn request(&self, request: Request, timeout: Duration) -> Result<DaemonFrame> {
        let line = request.to_line()?;
        let id = request.id;
        let (reply, response) = oneshot::channel();

        let cmd_tx = self.command_sender().await?;
        cmd_tx
            .send(ConnectionCommand::Request {
                id: id.clone(),
                line,
                reply,
            })
            .await
            .map_err(|_| closed())?;

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(closed()),
            Err(_) => {
                let _ = cmd_tx.send(ConnectionCommand::Cancel { id: id.clone() }).await;
                warn!(id = %id, "No reply from daemon before the deadline");
                Err(NetError::Timeout(timeout))
            }
        }
    }

    /// Write a subscribe command for `number` and stream every frame routed
    /// to it.
    pub async fn subscribe(&self, request: Request, number: &str) -> Result<Subscription> {
        let line = request.to_line()?;
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (written, done) = oneshot::channel();

        let cmd_tx = self.command_sender().await?;
        cmd_tx
            .send(ConnectionCommand::Subscribe {
                id: request.id.clone(),
                number: number.to_string(),
                line,
                frames: frames_tx,
                written,
            })
            .await
            .map_err(|_| closed())?;
        await_write(done).await?;

        Ok(Subscription::new(request.id, number, frames_rx, cmd_tx))
    }

    async fn command_sender(&self) -> Result<mpsc::Sender<ConnectionCommand>> {
        let guard = self.connection.lock().await;
        match guard.as_ref() {
            Some(connection) if connection.is_open() => Ok(connection.cmd_tx.clone()),
            _ => Err(NetError::Transport("Not connected to daemon".into())),
        }
    }

    async fn dispatch(&self, command: ConnectionCommand) -> Result<()> {
        self.command_sender()
            .await?
            .send(command)
            .await
            .map_err(|_| closed())
    }
}

fn closed() -> NetError {
    NetError::Transport("Connection to daemon closed".into())
}

async fn await_write(done: oneshot::Receiver<Result<()>>) -> Result<()> {
    done.await.map_err(|_| closed())?
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

async fn run_connection(stream: UnixStream, mut cmd_rx: mpsc::Receiver<ConnectionCommand>) {
    let (read_half, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut correlator = Correlator::new();

    let reason = loop {
        tokio::select! {
            // --- Outbound commands ---
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ConnectionCommand::Request { id, line, reply }) => {
                        correlator.register_reply(id, reply);
                        if let Err(e) = write_line(&mut writer, &line).await {
                            break e;
                        }
                    }
                    Some(ConnectionCommand::Write { line, written }) => {
                        match write_line(&mut writer, &line).await {
                            Ok(()) => {
                                let _ = written.send(Ok(()));
                            }
                            Err(e) => {
                                let _ = written.send(Err(NetError::Transport(e.clone())));
                                break e;
                            }
                        }
                    }
                    Some(ConnectionCommand::Subscribe { id, number, line, frames, written }) => {
                        correlator.register_subscription(id.clone(), number.clone(), frames);
                        match write_line(&mut writer, &line).await {
                            Ok(()) => {
                                let _ = written.send(Ok(()));
                            }
                            Err(e) => {
                                correlator.release_subscription(&id, &number);
                                let _ = written.send(Err(NetError::Transport(e.clone())));
                                break e;
                            }
                        }
                    }
                    Some(ConnectionCommand::Unsubscribe { id, number, line }) => {
                        if !correlator.release_subscription(&id, &number) {
                            debug!(
                                id = %id,
                                number = %number,
                                remaining = correlator.holders(&number),
                                "Subscription released, number still subscribed"
                            );
                        } else if let Some(line) = line {
                            if let Err(e) = write_line(&mut writer, &line).await {
                                break e;
                            }
                        }
                    }
                    Some(ConnectionCommand::Cancel { id }) => {
                        correlator.cancel_reply(&id);
                    }
                    Some(ConnectionCommand::Shutdown) => {
                        debug!("Connection shutdown requested");
                        break "Disconnected from daemon".to_string();
                    }
                    None => {
                        break "Connection handle dropped".to_string();
                    }
                }
            }

            // --- Inbound frames ---
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => handle_line(&mut correlator, &line),
                    Ok(None) => break "Daemon closed the connection".to_string(),
                    Err(e) => break format!("Failed to read from daemon: {e}"),
                }
            }
        }
    };

    debug!(
        reason = %reason,
        pending = correlator.pending_count(),
        subscriptions = correlator.subscription_count(),
        "Connection event loop terminated"
    );
    // Close the queue first so the handle reports disconnected before any
    // waiter learns about the failure.
    cmd_rx.close();
    correlator.fail_all(&reason);
    let _ = writer.shutdown().await;
}

fn handle_line(correlator: &mut Correlator, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    match DaemonFrame::parse(line) {
        Ok(frame) => {
            debug!(id = ?frame.id, kind = %frame.kind, done = frame.done, "Frame received");
            correlator.route(frame);
        }
        Err(error) => {
            warn!(error = %error, line = %line, "Malformed frame from daemon");
            correlator.deliver_protocol_error(error);
        }
    }
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &str) -> std::result::Result<(), String> {
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| format!("Failed to write to daemon: {e}"))?;
    writer
        .flush()
        .await
        .map_err(|e| format!("Failed to flush to daemon: {e}"))
}
