//! TCP proxy (spec.md §4.8): one listener per allocated TCP port, an accept
//! loop per listener, and two byte pumps per accepted connection running
//! over the same duplex-stream request queue / response mailbox machinery
//! C7 uses for HTTP.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use tunnel_protocol::{Payload, RequestFrame, TcpChunk};

use crate::error::EdgeError;
use crate::registry::manager::TcpListenerController;
use crate::registry::{MailboxKind, MailboxMessage, Manager};

/// Read-side buffer size for connection→tunnel bytes (spec.md §4.8).
const READ_CHUNK_SIZE: usize = 32 * 1024;
/// Write deadline for tunnel→connection bytes.
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
/// How long `accept()` blocks before re-checking the shutdown token, so a
/// `StopListener` call is never stuck behind a slow accept.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_secs(1);

struct ListenerHandle {
    shutdown: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

/// Owns the `port → active listener` map (spec.md §4.8) and is plugged into
/// [`Manager`] as its [`TcpListenerController`].
///
/// `manager` is set once via [`TcpProxy::bind_manager`] after both have been
/// constructed — `Manager::new` itself requires a `TcpListenerController`,
/// so the two cannot be built in a single straight line.
pub struct TcpProxy {
    manager: OnceLock<Arc<Manager>>,
    listeners: DashMap<u16, ListenerHandle>,
}

impl TcpProxy {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            manager: OnceLock::new(),
            listeners: DashMap::new(),
        })
    }

    /// Supplies the registry this proxy dispatches accepted connections
    /// into. Must be called exactly once, before any tunnel registers.
    pub fn bind_manager(&self, manager: Arc<Manager>) {
        self.manager
            .set(manager)
            .unwrap_or_else(|_| panic!("TcpProxy::bind_manager called more than once"));
    }

    fn manager(&self) -> Arc<Manager> {
        self.manager
            .get()
            .expect("TcpProxy::bind_manager must run before any tunnel registers")
            .clone()
    }

    /// Closes every listener idempotently (server shutdown, spec.md §4.8).
    pub async fn shutdown_all(&self) {
        let ports: Vec<u16> = self.listeners.iter().map(|e| *e.key()).collect();
        for port in ports {
            self.stop_listener(port).await;
        }
    }
}

#[async_trait::async_trait]
impl TcpListenerController for TcpProxy {
    async fn start_listener(&self, port: u16, tunnel_id: Uuid) -> Result<(), EdgeError> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| EdgeError::Internal(format!("failed to bind TCP port {port}: {e}")))?;
        let shutdown = CancellationToken::new();
        let manager = self.manager();
        let task_shutdown = shutdown.clone();
        let task = tokio::spawn(async move {
            accept_loop(listener, manager, tunnel_id, task_shutdown).await;
        });
        if let Some(previous) = self.listeners.insert(port, ListenerHandle { shutdown, task }) {
            previous.shutdown.cancel();
            previous.task.abort();
        }
        info!(port, tunnel_id = %tunnel_id, "tcp listener started");
        Ok(())
    }

    async fn stop_listener(&self, port: u16) {
        if let Some((_, handle)) = self.listeners.remove(&port) {
            handle.shutdown.cancel();
            let _ = handle.task.await;
            info!(port, "tcp listener stopped");
        }
    }
}

async fn accept_loop(listener: TcpListener, manager: Arc<Manager>, tunnel_id: Uuid, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = tokio::time::timeout(ACCEPT_POLL_INTERVAL, listener.accept()) => {
                match accepted {
                    Ok(Ok((stream, peer))) => {
                        let manager = manager.clone();
                        tokio::spawn(async move {
                            handle_connection(manager, tunnel_id, stream, peer.to_string()).await;
                        });
                    }
                    Ok(Err(e)) => {
                        warn!(tunnel_id = %tunnel_id, error = %e, "tcp accept failed");
                    }
                    Err(_elapsed) => {
                        // Poll interval lapsed with no connection; loop back
                        // around to re-check the shutdown token.
                    }
                }
            }
        }
    }
}

async fn handle_connection(manager: Arc<Manager>, tunnel_id: Uuid, stream: TcpStream, peer: String) {
    let Some(tunnel) = manager.lookup_by_id(tunnel_id) else {
        return;
    };

    let request_id = Uuid::new_v4();
    let mut mailbox = tunnel.register_pending(request_id, MailboxKind::Tcp, 16);
    let (mut read_half, mut write_half) = stream.into_split();
    let cancel = CancellationToken::new();

    let upstream_tunnel = tunnel.clone();
    let upstream_cancel = cancel.clone();
    let upstream_peer = peer.clone();
    let upstream = tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        let mut sequence = 0u64;
        loop {
            tokio::select! {
                _ = upstream_cancel.cancelled() => break,
                read = read_half.read(&mut buf) => {
                    match read {
                        Ok(0) => break,
                        Ok(n) => {
                            let frame = RequestFrame {
                                request_id,
                                tunnel_id,
                                payload: Payload::Tcp(TcpChunk { bytes: buf[..n].to_vec(), sequence }),
                            };
                            sequence += 1;
                            upstream_tunnel.update_stats(n as u64, 0);
                            if upstream_tunnel.enqueue_request(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(tunnel_id = %tunnel_id, peer = %upstream_peer, error = %e, "tcp connection read error");
                            break;
                        }
                    }
                }
            }
        }
        // Terminal empty frame: tells the client to close its local socket
        // (spec.md §4.8).
        let _ = upstream_tunnel
            .enqueue_request(RequestFrame {
                request_id,
                tunnel_id,
                payload: Payload::Tcp(TcpChunk { bytes: Vec::new(), sequence }),
            })
            .await;
        upstream_cancel.cancel();
    });

    let downstream_tunnel = tunnel.clone();
    let downstream_cancel = cancel.clone();
    let downstream = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = downstream_cancel.cancelled() => break,
                received = timeout(WRITE_DEADLINE, mailbox.recv()) => {
                    match received {
                        Ok(Some(MailboxMessage::Response(frame))) => {
                            let Payload::Tcp(chunk) = frame.payload else { continue };
                            if chunk.bytes.is_empty() || frame.end_of_stream {
                                break;
                            }
                            downstream_tunnel.update_stats(0, chunk.bytes.len() as u64);
                            if timeout(WRITE_DEADLINE, write_half.write_all(&chunk.bytes)).await.is_err() {
                                break;
                            }
                        }
                        Ok(Some(MailboxMessage::Error(_))) | Ok(None) => break,
                        Err(_elapsed) => break,
                    }
                }
            }
        }
        let _ = write_half.shutdown().await;
        downstream_cancel.cancel();
    });

    let _ = tokio::join!(upstream, downstream);
    tunnel.remove_pending(request_id, MailboxKind::Tcp);
}
